//! 抽签策略：按剩余权重的概率随机选取

use super::{Balancer, empty_pool_error};
use crate::error::Result;
use rand::Rng;
use std::collections::HashMap;

/// 加权随机负载均衡器
pub struct Lottery {
    items: Vec<(i32, i32)>,
}

impl Lottery {
    #[must_use]
    pub fn new(weights: &HashMap<i32, i32>) -> Self {
        let mut items: Vec<(i32, i32)> = weights
            .iter()
            .map(|(&id, &weight)| (id, weight.max(0)))
            .collect();
        // 固定遍历顺序，保证同一随机数得到可复现的结果
        items.sort_by_key(|(id, _)| *id);
        Self { items }
    }
}

impl Balancer for Lottery {
    fn pop(&mut self) -> Result<i32> {
        if self.items.is_empty() {
            return Err(empty_pool_error());
        }
        let total: i64 = self.items.iter().map(|(_, w)| i64::from(*w)).sum();
        if total <= 0 {
            // 全部权重为零时退化为均匀抽取
            let idx = rand::thread_rng().gen_range(0..self.items.len());
            return Ok(self.items[idx].0);
        }
        let mut ticket = rand::thread_rng().gen_range(0..total);
        for (id, weight) in &self.items {
            ticket -= i64::from(*weight);
            if ticket < 0 {
                return Ok(*id);
            }
        }
        Ok(self.items[self.items.len() - 1].0)
    }

    fn reduce(&mut self, id: i32) {
        if let Some(item) = self.items.iter_mut().find(|(item_id, _)| *item_id == id) {
            item.1 = (item.1 / 2).max(1);
        }
    }

    fn delete(&mut self, id: i32) {
        self.items.retain(|(item_id, _)| *item_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(i32, i32)]) -> HashMap<i32, i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn pop_respects_weight_distribution() {
        let mut lottery = Lottery::new(&weights(&[(1, 1), (2, 99)]));
        let mut hits = 0;
        for _ in 0..200 {
            if lottery.pop().unwrap() == 2 {
                hits += 1;
            }
        }
        // 权重 99:1 之下重度候选应当占绝对多数
        assert!(hits > 150);
    }

    #[test]
    fn reduce_halves_with_floor_one() {
        let mut lottery = Lottery::new(&weights(&[(1, 3)]));
        lottery.reduce(1);
        assert_eq!(lottery.items[0].1, 1);
        lottery.reduce(1);
        assert_eq!(lottery.items[0].1, 1);
    }

    #[test]
    fn pop_on_empty_errors() {
        let mut lottery = Lottery::new(&HashMap::new());
        assert!(lottery.pop().is_err());
    }
}
