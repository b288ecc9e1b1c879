//! # 响应缓存模块
//!
//! 有界内存缓存，按 (租户, 风格, 模型, 模式, 正文哈希) 隔离。
//! 淘汰策略是按写入时间先进先出而非 LRU：典型负载是同一调用方短时间内的
//! 重复请求，严格 LRU 需要每次命中额外写锁，收益不成比例

pub mod key_builder;

pub use key_builder::{build_cache_key, mode_for_style, normalize_and_hash, validate_key};

use crate::error::{ProxyError, Result};
use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// 默认最大缓存条目数
pub const DEFAULT_MAX_ENTRIES: usize = 1024;
/// 默认缓存有效期
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// 缓存作用域，AuthKeyID 保证多租户隔离
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub auth_key_id: i32,
    pub style: String,
    pub model: String,
    pub mode: String,
    pub stream: bool,
}

/// 缓存键，作用域加请求正文哈希
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub scope: Scope,
    pub body_hash: String,
}

impl Key {
    /// 序列化为内部 map 键
    #[must_use]
    pub fn map_key(&self) -> String {
        let s = &self.scope;
        format!(
            "{}|{}|{}|{}|{}|{}",
            s.auth_key_id, s.style, s.model, s.mode, s.stream, self.body_hash
        )
    }
}

/// 缓存读取策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// 深拷贝返回
    #[default]
    Clone,
    /// 只读共享返回，调用方不得修改
    ShareReadOnly,
}

/// 缓存配置选项
#[derive(Debug, Clone)]
pub struct Options {
    pub max_entries: usize,
    pub read_policy: ReadPolicy,
    /// 共享阈值，字节。仅不小于该值的响应按共享返回，0 表示不限
    pub share_threshold: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            read_policy: ReadPolicy::Clone,
            share_threshold: 0,
        }
    }
}

/// 缓存的响应数据
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub status_code: u16,
    pub header: HeaderMap,
    pub body: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 最初生成缓存的日志 ID
    pub source_log_id: i32,
    pub provider_name: String,
    pub provider_model: String,
    /// 是否为只读共享引用
    pub shared: bool,
}

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hit_count: u64,
    pub miss_count: u64,
}

struct Entry {
    key: Key,
    value: Value,
}

struct Inner {
    data: HashMap<String, Entry>,
    hit_count: u64,
    miss_count: u64,
}

/// 线程安全的内存缓存
pub struct MemoryCache {
    inner: RwLock<Inner>,
    max_entries: usize,
    read_policy: ReadPolicy,
    share_threshold: usize,
}

impl MemoryCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self::with_options(Options {
            max_entries,
            ..Options::default()
        })
    }

    #[must_use]
    pub fn with_options(opts: Options) -> Self {
        let max_entries = if opts.max_entries == 0 {
            DEFAULT_MAX_ENTRIES
        } else {
            opts.max_entries
        };
        Self {
            inner: RwLock::new(Inner {
                data: HashMap::with_capacity(max_entries),
                hit_count: 0,
                miss_count: 0,
            }),
            max_entries,
            read_policy: opts.read_policy,
            share_threshold: opts.share_threshold,
        }
    }

    /// 查询缓存，过期条目在写锁下双重检查后删除并按未命中处理
    pub fn get(&self, key: &Key) -> Option<Value> {
        let map_key = key.map_key();
        let now = Utc::now();

        let found = {
            let inner = self.inner.read().expect("cache lock poisoned");
            inner.data.get(&map_key).map(|entry| {
                (
                    now > entry.value.expires_at,
                    entry.value.clone(),
                )
            })
        };

        match found {
            None => {
                let mut inner = self.inner.write().expect("cache lock poisoned");
                inner.miss_count += 1;
                None
            }
            Some((true, _)) => {
                let mut inner = self.inner.write().expect("cache lock poisoned");
                // 双重检查，期间条目可能已被覆盖
                if inner
                    .data
                    .get(&map_key)
                    .is_some_and(|entry| now > entry.value.expires_at)
                {
                    inner.data.remove(&map_key);
                }
                inner.miss_count += 1;
                None
            }
            Some((false, value)) => {
                {
                    let mut inner = self.inner.write().expect("cache lock poisoned");
                    inner.hit_count += 1;
                }
                let share_allowed = self.read_policy == ReadPolicy::ShareReadOnly;
                let big_enough =
                    self.share_threshold == 0 || value.body.len() >= self.share_threshold;
                let mut out = value;
                out.shared = share_allowed && big_enough;
                Some(out)
            }
        }
    }

    /// 写入缓存。零租户键拒绝写入，容量满时淘汰最早写入的条目
    pub fn set(&self, key: &Key, mut value: Value, ttl: Duration) -> Result<()> {
        if key.scope.auth_key_id == 0 {
            return Err(ProxyError::cache("refusing to cache zero auth key entry"));
        }
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };

        let now = Utc::now();
        value.created_at = now;
        value.expires_at = now
            + ChronoDuration::from_std(ttl)
                .unwrap_or_else(|_| ChronoDuration::seconds(ttl.as_secs() as i64));
        value.shared = false;

        let mut inner = self.inner.write().expect("cache lock poisoned");
        if self.max_entries > 0 && inner.data.len() >= self.max_entries {
            evict_oldest_locked(&mut inner);
        }
        inner.data.insert(
            key.map_key(),
            Entry {
                key: key.clone(),
                value,
            },
        );
        Ok(())
    }

    /// 清空指定租户的全部缓存
    pub fn delete_by_auth_key(&self, auth_key_id: i32) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner
            .data
            .retain(|_, entry| entry.key.scope.auth_key_id != auth_key_id);
    }

    /// 按请求风格清空缓存
    pub fn delete_by_style(&self, style: &str) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.data.retain(|_, entry| entry.key.scope.style != style);
    }

    /// 获取统计信息
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().expect("cache lock poisoned");
        CacheStats {
            entries: inner.data.len(),
            hit_count: inner.hit_count,
            miss_count: inner.miss_count,
        }
    }
}

/// 淘汰 created_at 最早的条目，需持有写锁
fn evict_oldest_locked(inner: &mut Inner) {
    let oldest = inner
        .data
        .iter()
        .min_by_key(|(_, entry)| entry.value.created_at)
        .map(|(map_key, _)| map_key.clone());
    if let Some(map_key) = oldest {
        inner.data.remove(&map_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(auth_key_id: i32, style: &str, hash: &str) -> Key {
        Key {
            scope: Scope {
                auth_key_id,
                style: style.to_string(),
                model: "m1".to_string(),
                mode: "chat_completions".to_string(),
                stream: false,
            },
            body_hash: hash.to_string(),
        }
    }

    fn value_with_body(body: &str) -> Value {
        Value {
            status_code: 200,
            header: HeaderMap::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            source_log_id: 7,
            provider_name: "p".to_string(),
            provider_model: "gpt".to_string(),
            shared: false,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = MemoryCache::new(8);
        let key = key_for(1, "openai", "h1");
        cache
            .set(&key, value_with_body("hello"), Duration::from_secs(60))
            .unwrap();
        let got = cache.get(&key).expect("hit");
        assert_eq!(got.body, Bytes::from_static(b"hello"));
        assert_eq!(got.source_log_id, 7);
        assert!(!got.shared);
        assert_eq!(cache.stats().hit_count, 1);
    }

    #[test]
    fn zero_auth_key_is_rejected() {
        let cache = MemoryCache::new(8);
        let key = key_for(0, "openai", "h1");
        assert!(
            cache
                .set(&key, value_with_body("x"), Duration::from_secs(60))
                .is_err()
        );
    }

    #[test]
    fn expired_entry_is_deleted_and_counted_as_miss() {
        let cache = MemoryCache::new(8);
        let key = key_for(1, "openai", "h1");
        cache
            .set(&key, value_with_body("x"), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&key).is_none());
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn capacity_overflow_evicts_first_inserted() {
        let cache = MemoryCache::new(3);
        for i in 1..=3 {
            cache
                .set(
                    &key_for(1, "openai", &format!("h{i}")),
                    value_with_body("x"),
                    Duration::from_secs(60),
                )
                .unwrap();
            // 保证 created_at 单调递增
            std::thread::sleep(Duration::from_millis(2));
        }
        cache
            .set(
                &key_for(1, "openai", "h4"),
                value_with_body("x"),
                Duration::from_secs(60),
            )
            .unwrap();
        assert_eq!(cache.stats().entries, 3);
        assert!(cache.get(&key_for(1, "openai", "h1")).is_none());
        assert!(cache.get(&key_for(1, "openai", "h4")).is_some());
    }

    #[test]
    fn delete_by_auth_key_scopes_to_tenant() {
        let cache = MemoryCache::new(8);
        cache
            .set(
                &key_for(1, "openai", "h1"),
                value_with_body("x"),
                Duration::from_secs(60),
            )
            .unwrap();
        cache
            .set(
                &key_for(2, "openai", "h2"),
                value_with_body("x"),
                Duration::from_secs(60),
            )
            .unwrap();
        cache.delete_by_auth_key(1);
        assert!(cache.get(&key_for(1, "openai", "h1")).is_none());
        assert!(cache.get(&key_for(2, "openai", "h2")).is_some());
    }

    #[test]
    fn delete_by_style_scopes_to_style() {
        let cache = MemoryCache::new(8);
        cache
            .set(
                &key_for(1, "openai", "h1"),
                value_with_body("x"),
                Duration::from_secs(60),
            )
            .unwrap();
        cache
            .set(
                &key_for(1, "anthropic", "h2"),
                value_with_body("x"),
                Duration::from_secs(60),
            )
            .unwrap();
        cache.delete_by_style("openai");
        assert!(cache.get(&key_for(1, "openai", "h1")).is_none());
        assert!(cache.get(&key_for(1, "anthropic", "h2")).is_some());
    }

    #[test]
    fn share_read_only_marks_value_shared() {
        let cache = MemoryCache::with_options(Options {
            max_entries: 8,
            read_policy: ReadPolicy::ShareReadOnly,
            share_threshold: 4,
        });
        let key = key_for(1, "openai", "h1");
        cache
            .set(&key, value_with_body("large enough"), Duration::from_secs(60))
            .unwrap();
        assert!(cache.get(&key).unwrap().shared);

        let small_key = key_for(1, "openai", "h2");
        cache
            .set(&small_key, value_with_body("x"), Duration::from_secs(60))
            .unwrap();
        assert!(!cache.get(&small_key).unwrap().shared);
    }
}
