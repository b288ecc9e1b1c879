//! # 常量定义模块

/// 请求风格: OpenAI chat completions
pub const STYLE_OPENAI: &str = "openai";
/// 请求风格: OpenAI Responses
pub const STYLE_OPENAI_RES: &str = "openai-res";
/// 请求风格: Anthropic Messages
pub const STYLE_ANTHROPIC: &str = "anthropic";

/// 按权重概率抽取，类似抽签
pub const BALANCER_LOTTERY: &str = "lottery";
/// 按顺序循环轮转，每次选中后降低权重并移到队尾
pub const BALANCER_ROTOR: &str = "rotor";
/// 平滑加权轮询
pub const BALANCER_SMOOTH_WEIGHTED_RR: &str = "smooth_weighted_rr";
/// 一致性哈希，最大化缓存命中率
pub const BALANCER_CONSISTENT_HASH: &str = "consistent_hash";
/// 默认策略
pub const BALANCER_DEFAULT: &str = BALANCER_LOTTERY;

/// 接入密钥前缀
pub const AUTH_KEY_PREFIX: &str = "sk-llmio-";
/// 接入密钥去除前缀后的长度
pub const AUTH_KEY_LENGTH: usize = 32;
