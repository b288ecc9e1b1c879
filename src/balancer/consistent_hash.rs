//! 一致性哈希策略：按权重铺设虚拟节点，请求键落点决定候选

use super::{Balancer, empty_pool_error};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// 每单位权重铺设的虚拟节点数
const REPLICAS_PER_WEIGHT: i32 = 16;

/// 一致性哈希负载均衡器。同一哈希键在候选集不变时总是落到同一候选，
/// 候选被移除后顺延到环上的下一个节点
pub struct ConsistentHash {
    ring: BTreeMap<u64, i32>,
    weights: HashMap<i32, i32>,
    point: u64,
}

impl ConsistentHash {
    #[must_use]
    pub fn new(weights: &HashMap<i32, i32>, hash_key: &str) -> Self {
        let weights: HashMap<i32, i32> = weights
            .iter()
            .map(|(&id, &weight)| (id, weight.max(1)))
            .collect();
        let mut hash = Self {
            ring: BTreeMap::new(),
            weights,
            point: hash_u64(hash_key.as_bytes()),
        };
        hash.rebuild();
        hash
    }

    fn rebuild(&mut self) {
        self.ring.clear();
        for (&id, &weight) in &self.weights {
            for replica in 0..weight.saturating_mul(REPLICAS_PER_WEIGHT) {
                let node_key = format!("{id}:{replica}");
                self.ring.insert(hash_u64(node_key.as_bytes()), id);
            }
        }
    }

    fn locate(&self) -> Option<i32> {
        self.ring
            .range(self.point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &id)| id)
    }
}

impl Balancer for ConsistentHash {
    fn pop(&mut self) -> Result<i32> {
        self.locate().ok_or_else(empty_pool_error)
    }

    fn reduce(&mut self, id: i32) {
        if let Some(weight) = self.weights.get_mut(&id) {
            *weight = (*weight / 2).max(1);
            self.rebuild();
        }
    }

    fn delete(&mut self, id: i32) {
        if self.weights.remove(&id).is_some() {
            self.rebuild();
        }
    }
}

fn hash_u64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(i32, i32)]) -> HashMap<i32, i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn same_key_maps_to_same_candidate() {
        let pool = weights(&[(1, 1), (2, 1), (3, 1)]);
        let mut a = ConsistentHash::new(&pool, "tenant-42");
        let mut b = ConsistentHash::new(&pool, "tenant-42");
        assert_eq!(a.pop().unwrap(), b.pop().unwrap());
    }

    #[test]
    fn delete_moves_key_to_next_node() {
        let pool = weights(&[(1, 1), (2, 1), (3, 1)]);
        let mut hash = ConsistentHash::new(&pool, "tenant-42");
        let first = hash.pop().unwrap();
        hash.delete(first);
        let second = hash.pop().unwrap();
        assert_ne!(first, second);
        hash.delete(second);
        let third = hash.pop().unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);
        hash.delete(third);
        assert!(hash.pop().is_err());
    }

    #[test]
    fn most_keys_keep_their_candidate_after_eviction() {
        let pool = weights(&[(1, 4), (2, 4), (3, 4)]);
        let keys: Vec<String> = (0..100).map(|i| format!("key-{i}")).collect();
        let before: Vec<i32> = keys
            .iter()
            .map(|key| ConsistentHash::new(&pool, key).pop().unwrap())
            .collect();
        let moved = keys
            .iter()
            .zip(&before)
            .filter(|&(key, &was)| {
                let mut hash = ConsistentHash::new(&pool, key);
                hash.delete(3);
                was != 3 && hash.pop().unwrap() != was
            })
            .count();
        // 移除一个候选仅应迁移原本落在它身上的键
        assert_eq!(moved, 0);
    }
}
