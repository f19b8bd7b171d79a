// src/date.rs
//! Cached `Date` header value.
//!
//! A background ticker formats the HTTP-date once per second; responses only
//! ever clone the cached string. If the ticker falls behind, readers keep
//! getting the last value it produced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

const TICK: Duration = Duration::from_secs(1);

struct Shared {
    value: RwLock<Arc<str>>,
    stopped: AtomicBool,
}

impl Shared {
    fn store(&self, value: Arc<str>) {
        match self.value.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

pub struct DateHeaderCache {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

fn now_value() -> Arc<str> {
    httpdate::fmt_http_date(SystemTime::now()).into()
}

impl DateHeaderCache {
    /// Format the current date and start the once-per-second ticker thread.
    pub fn start() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            value: RwLock::new(now_value()),
            stopped: AtomicBool::new(false),
        });

        let ticker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("etude-date".to_string())
            .spawn(move || {
                while !ticker_shared.stopped.load(Ordering::Acquire) {
                    thread::park_timeout(TICK);
                    if ticker_shared.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    ticker_shared.store(now_value());
                }
                tracing::trace!("date header ticker stopped");
            })?;

        Ok(Self {
            shared,
            ticker: Mutex::new(Some(handle)),
        })
    }

    /// A cache pinned to `value` that never ticks.
    pub fn fixed(value: impl Into<Arc<str>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: RwLock::new(value.into()),
                stopped: AtomicBool::new(true),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// The preformatted value for the current tick.
    #[inline]
    pub fn current(&self) -> Arc<str> {
        match self.shared.value.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the ticker and join its thread. Safe to call more than once.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let handle = match self.ticker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for DateHeaderCache {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DateHeaderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DateHeaderCache")
            .field("current", &self.current())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_value_is_served() {
        let cache = DateHeaderCache::fixed("Tue, 01 Jan 2030 00:00:00 GMT");
        assert_eq!(&*cache.current(), "Tue, 01 Jan 2030 00:00:00 GMT");
        assert!(!cache.is_running());
        cache.stop();
    }

    #[test]
    fn test_started_cache_parses_as_http_date() {
        let cache = DateHeaderCache::start().unwrap();
        let value = cache.current();
        assert!(httpdate::parse_http_date(&value).is_ok(), "bad date {value}");
        assert!(value.ends_with("GMT"));
        cache.stop();
        cache.stop();
        assert!(!cache.is_running());
    }

    #[test]
    fn test_value_advances_after_a_tick() {
        let cache = DateHeaderCache::start().unwrap();
        let first = httpdate::parse_http_date(&cache.current()).unwrap();
        thread::sleep(Duration::from_millis(2_100));
        let later = httpdate::parse_http_date(&cache.current()).unwrap();
        assert!(later > first);
        cache.stop();
    }
}
