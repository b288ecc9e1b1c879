//! # 负载均衡模块
//!
//! 四种可互换的加权选取策略，状态仅存活于单次调度调用内

mod consistent_hash;
mod lottery;
mod rotor;
mod smooth_weighted;

pub use consistent_hash::ConsistentHash;
pub use lottery::Lottery;
pub use rotor::Rotor;
pub use smooth_weighted::SmoothWeightedRR;

use crate::consts;
use crate::error::{ProxyError, Result};
use std::collections::HashMap;

/// 负载均衡器契约。`pop` 选出下一个候选，`reduce` 降权但保留，`delete` 移除
pub trait Balancer: Send {
    /// 选出下一个候选 ID，候选集为空时返回错误
    fn pop(&mut self) -> Result<i32>;

    /// 降低指定候选的权重，不移除
    fn reduce(&mut self, id: i32);

    /// 将指定候选从候选集中移除
    fn delete(&mut self, id: i32);
}

/// 按策略名构建负载均衡器，未知策略与空串回落到默认 lottery。
/// consistent_hash 需要显式哈希输入，缺失时同样回落到 lottery
pub fn build_balancer(
    strategy: &str,
    weights: &HashMap<i32, i32>,
    hash_key: Option<&str>,
) -> Box<dyn Balancer> {
    match strategy {
        consts::BALANCER_SMOOTH_WEIGHTED_RR => Box::new(SmoothWeightedRR::new(weights)),
        consts::BALANCER_ROTOR => Box::new(Rotor::new(weights)),
        consts::BALANCER_CONSISTENT_HASH => match hash_key {
            Some(key) => Box::new(ConsistentHash::new(weights, key)),
            None => Box::new(Lottery::new(weights)),
        },
        _ => Box::new(Lottery::new(weights)),
    }
}

pub(crate) fn empty_pool_error() -> ProxyError {
    ProxyError::business("balancer pool is empty")
}
