//! # 应用配置模块
//!
//! TOML 配置文件加载，环境变量可覆盖关键字段

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// 应用主配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// 响应缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 认证配置
    #[serde(default)]
    pub auth: AuthConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接串，支持 sqlite / mysql / postgres
    #[serde(default = "default_database_url")]
    pub url: String,
}

/// 响应缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 最大缓存条目数
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// 默认缓存有效期，单位秒
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// 读取策略: clone / share-read-only
    #[serde(default = "default_cache_read_policy")]
    pub read_policy: String,
    /// 共享阈值，字节。仅大于该值的响应按只读共享返回
    #[serde(default)]
    pub share_threshold: usize,
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// 管理员令牌，携带该令牌的请求视为零租户管理身份
    #[serde(default)]
    pub admin_token: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    7070
}

fn default_database_url() -> String {
    "sqlite://data/llmio.db".to_string()
}

const fn default_cache_max_entries() -> usize {
    1024
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_read_policy() -> String {
    "clone".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            default_ttl_secs: default_cache_ttl_secs(),
            read_policy: default_cache_read_policy(),
            share_threshold: 0,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: String::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// 加载配置。查找顺序: `LLMIO_CONFIG_PATH` > `config/config.{RUST_ENV}.toml`，
/// 文件缺失时使用默认值，随后应用环境变量覆盖
pub fn load_config() -> Result<AppConfig> {
    let config_file = env::var("LLMIO_CONFIG_PATH").unwrap_or_else(|_| {
        let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        format!("config/config.{env}.toml")
    });

    let mut config = if Path::new(&config_file).exists() {
        let content = std::fs::read_to_string(&config_file).map_err(|e| {
            ProxyError::config_with_source(format!("无法读取配置文件 {config_file}"), e.into())
        })?;
        toml::from_str(&content).map_err(|e| {
            ProxyError::config_with_source(format!("配置文件解析失败 {config_file}"), e.into())
        })?
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// 应用 LLMIO_* 环境变量覆盖
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(host) = env::var("LLMIO_SERVER_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = env::var("LLMIO_SERVER_PORT")
        && let Ok(port) = port.parse()
    {
        config.server.port = port;
    }
    if let Ok(url) = env::var("LLMIO_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
        config.database.url = url;
    }
    if let Ok(token) = env::var("LLMIO_ADMIN_TOKEN") {
        config.auth.admin_token = token;
    }
    if let Ok(entries) = env::var("LLMIO_CACHE_MAX_ENTRIES")
        && let Ok(entries) = entries.parse()
    {
        config.cache.max_entries = entries;
    }
    if let Ok(ttl) = env::var("LLMIO_CACHE_TTL_SECS")
        && let Ok(ttl) = ttl.parse()
    {
        config.cache.default_ttl_secs = ttl;
    }
}
