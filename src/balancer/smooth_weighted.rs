//! 平滑加权轮询策略

use super::{Balancer, empty_pool_error};
use crate::error::Result;
use std::collections::HashMap;

struct Entry {
    id: i32,
    weight: i32,
    current: i32,
}

/// 经典平滑加权轮询：每轮 current 加上自身权重，取最大者并减去总权重
pub struct SmoothWeightedRR {
    entries: Vec<Entry>,
}

impl SmoothWeightedRR {
    #[must_use]
    pub fn new(weights: &HashMap<i32, i32>) -> Self {
        let mut entries: Vec<Entry> = weights
            .iter()
            .map(|(&id, &weight)| Entry {
                id,
                weight: weight.max(1),
                current: 0,
            })
            .collect();
        entries.sort_by_key(|entry| entry.id);
        Self { entries }
    }

    fn total_weight(&self) -> i32 {
        self.entries.iter().map(|entry| entry.weight).sum()
    }
}

impl Balancer for SmoothWeightedRR {
    fn pop(&mut self) -> Result<i32> {
        if self.entries.is_empty() {
            return Err(empty_pool_error());
        }
        let total = self.total_weight();
        for entry in &mut self.entries {
            entry.current += entry.weight;
        }
        let best = self
            .entries
            .iter_mut()
            .max_by_key(|entry| entry.current)
            .ok_or_else(empty_pool_error)?;
        best.current -= total;
        Ok(best.id)
    }

    fn reduce(&mut self, id: i32) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.weight = (entry.weight / 2).max(1);
        }
    }

    fn delete(&mut self, id: i32) {
        self.entries.retain(|entry| entry.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(i32, i32)]) -> HashMap<i32, i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn distribution_follows_weights() {
        let mut rr = SmoothWeightedRR::new(&weights(&[(1, 5), (2, 1), (3, 1)]));
        let mut counts = HashMap::new();
        for _ in 0..7 {
            *counts.entry(rr.pop().unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts[&1], 5);
        assert_eq!(counts[&2], 1);
        assert_eq!(counts[&3], 1);
    }

    #[test]
    fn smooth_sequence_interleaves_heavy_entry() {
        // 权重 {a:4, b:2, c:1} 的经典平滑轮询序列是确定的
        let mut rr = SmoothWeightedRR::new(&weights(&[(1, 4), (2, 2), (3, 1)]));
        let seq: Vec<i32> = (0..7).map(|_| rr.pop().unwrap()).collect();
        assert_eq!(seq, vec![1, 2, 1, 3, 1, 2, 1]);
    }

    #[test]
    fn reduce_scales_weight_down() {
        let mut rr = SmoothWeightedRR::new(&weights(&[(1, 8), (2, 1)]));
        rr.reduce(1);
        assert_eq!(rr.entries[0].weight, 4);
    }
}
