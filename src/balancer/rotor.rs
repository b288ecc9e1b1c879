//! 轮转策略：确定性循环遍历，选中后降权移尾

use super::{Balancer, empty_pool_error};
use crate::error::Result;
use std::collections::{HashMap, VecDeque};

/// 循环轮转负载均衡器
pub struct Rotor {
    ring: VecDeque<(i32, i32)>,
}

impl Rotor {
    #[must_use]
    pub fn new(weights: &HashMap<i32, i32>) -> Self {
        let mut items: Vec<(i32, i32)> = weights
            .iter()
            .map(|(&id, &weight)| (id, weight.max(1)))
            .collect();
        // ID 升序作为确定性遍历顺序
        items.sort_by_key(|(id, _)| *id);
        Self {
            ring: items.into(),
        }
    }
}

impl Balancer for Rotor {
    fn pop(&mut self) -> Result<i32> {
        let (id, weight) = self.ring.pop_front().ok_or_else(empty_pool_error)?;
        self.ring.push_back((id, (weight - 1).max(1)));
        Ok(id)
    }

    fn reduce(&mut self, id: i32) {
        if let Some(item) = self.ring.iter_mut().find(|(item_id, _)| *item_id == id) {
            item.1 = (item.1 / 2).max(1);
        }
    }

    fn delete(&mut self, id: i32) {
        self.ring.retain(|(item_id, _)| *item_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(i32, i32)]) -> HashMap<i32, i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn pop_cycles_in_deterministic_order() {
        let mut rotor = Rotor::new(&weights(&[(3, 1), (1, 1), (2, 1)]));
        assert_eq!(rotor.pop().unwrap(), 1);
        assert_eq!(rotor.pop().unwrap(), 2);
        assert_eq!(rotor.pop().unwrap(), 3);
        assert_eq!(rotor.pop().unwrap(), 1);
    }

    #[test]
    fn weight_decrements_with_floor_one() {
        let mut rotor = Rotor::new(&weights(&[(1, 2)]));
        rotor.pop().unwrap();
        assert_eq!(rotor.ring[0].1, 1);
        rotor.pop().unwrap();
        assert_eq!(rotor.ring[0].1, 1);
    }

    #[test]
    fn delete_then_empty_pop_errors() {
        let mut rotor = Rotor::new(&weights(&[(1, 1)]));
        rotor.delete(1);
        assert!(rotor.pop().is_err());
    }
}
