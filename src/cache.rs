//! 结果缓存：按 (query_id, 规范化参数) 键入的 TTL 缓存
//!
//! - 读时惰性过期（age > ttl 即逐出并报 miss）
//! - 写入 last-writer-wins
//! - single-flight：同 key 并发请求只打一次后端，其余等待首个结果
//! - clear() 作为运维手动失效钩子；不做更复杂的失效策略

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

use crate::error::EngineError;

/// 缓存统计（/api/health 暴露）
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// 泛型 TTL 缓存；引擎用它缓存查询结果片段
pub struct TtlCache<V> {
    ttl: Duration,
    inner: std::sync::Mutex<HashMap<String, (V, Instant)>>,
    /// key -> 在途获取的通知句柄
    inflight: tokio::sync::Mutex<HashMap<String, Arc<Notify>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: std::sync::Mutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// 读取；过期条目在此处逐出
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some((_, inserted_at)) if inserted_at.elapsed() > self.ttl => {
                inner.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some((value, _)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key.to_string(), (value, Instant::now()));
    }

    /// 手动失效全部条目
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.inner.lock().unwrap().len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// single-flight 读取：命中直接返回；miss 时第一个调用方执行 fetch，
    /// 其余等待其完成后再读缓存。返回 (值, 是否来自缓存)。
    ///
    /// fetch 失败不写缓存；等待方会接棒成为新的执行者。
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<(V, bool), EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, EngineError>>,
    {
        let mut fetch = Some(fetch);
        loop {
            if let Some(v) = self.get(key) {
                return Ok((v, true));
            }

            let waiter = {
                let mut inflight = self.inflight.lock().await;
                // 拿到锁后再查一次，避免与刚完成的执行者交错
                if let Some(v) = self.get(key) {
                    return Ok((v, true));
                }
                match inflight.get(key) {
                    Some(n) => Some(n.clone()),
                    None => {
                        inflight.insert(key.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match waiter {
                Some(notify) => {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // 注册之后复查：执行者可能已经完成
                    if let Some(v) = self.get(key) {
                        return Ok((v, true));
                    }
                    if !self.inflight.lock().await.contains_key(key) {
                        continue;
                    }
                    notified.await;
                }
                None => {
                    let f = fetch.take().expect("leader only runs once");
                    let result = f().await;
                    if let Ok(ref v) = result {
                        self.insert(key, v.clone());
                    }
                    let mut inflight = self.inflight.lock().await;
                    if let Some(n) = inflight.remove(key) {
                        n.notify_waiters();
                    }
                    return result.map(|v| (v, false));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_hit_within_ttl() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_expired_entry_evicted_on_read() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_millis(0));
        cache.insert("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_last_writer_wins() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", "uno".to_string());
        cache.insert("k", "dos".to_string());
        assert_eq!(cache.get("k"), Some("dos".to_string()));
    }

    #[test]
    fn test_clear_invalidates() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", "v".to_string());
        cache.clear();
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_get_or_fetch_populates() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        let (v, cached) = cache
            .get_or_fetch("k", || async { Ok("v".to_string()) })
            .await
            .unwrap();
        assert_eq!(v, "v");
        assert!(!cached);

        let (v, cached) = cache
            .get_or_fetch("k", || async { unreachable!() })
            .await
            .unwrap();
        assert_eq!(v, "v");
        assert!(cached);
    }

    #[tokio::test]
    async fn test_fetch_error_not_cached() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_fetch("k", || async {
                Err::<String, _>(EngineError::UpstreamTimeout(30))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UpstreamTimeout(_)));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_single_flight_dedupes_concurrent_fetches() {
        let cache: Arc<TtlCache<String>> = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok("v".to_string())
                    })
                    .await
                    .unwrap()
                    .0
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
