//! Autosync (C8, §4.8): a periodic background task that flushes a handle's lingering
//! transactions by time or byte threshold.
//!
//! A named background thread polls on a short tick against a `Condvar`-gated stop flag, so a
//! stop request is observed promptly and joins synchronously.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

/// `(max_seconds, max_bytes)` as given to `autosync_start` (§6).
#[derive(Debug, Clone, Copy)]
pub struct AutosyncConfig {
    pub max_seconds: u64,
    pub max_bytes: u64,
}

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// A running autosync task. Dropping it without calling [`Autosync::stop`] leaks the thread
/// (it only exits on a stop signal); callers are expected to always stop explicitly, which
/// [`crate::handle::Handle::close`] does.
pub struct Autosync {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Autosync {
    /// Spawns the background task. `pending_bytes` reports the handle's current lingering
    /// byte total; `flush` runs the handle's `sync`. Both are called from the worker thread.
    pub fn start<P, F>(config: AutosyncConfig, pending_bytes: P, flush: F) -> Self
    where
        P: Fn() -> u64 + Send + 'static,
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("jiorn-autosync".to_owned())
            .spawn(move || run(worker_shared, config, pending_bytes, flush))
            .expect("failed to spawn autosync thread");
        Autosync {
            shared,
            worker: Some(worker),
        }
    }

    /// Signals the worker to stop and joins it before returning (§4.8 "stop requests are
    /// synchronous").
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Autosync {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

fn run<P, F>(shared: Arc<Shared>, config: AutosyncConfig, pending_bytes: P, flush: F)
where
    P: Fn() -> u64,
    F: Fn(),
{
    let interval = Duration::from_secs(config.max_seconds.max(1));
    // Poll at a tick well below the interval so the byte threshold (which the stop condvar
    // alone can't observe) is noticed promptly; never coarser than the interval itself.
    let tick = Duration::from_millis(100).min(interval);
    let mut last_flush = Instant::now();

    loop {
        let mut stop = shared.stop.lock();
        if *stop {
            return;
        }
        let result = shared.wake.wait_for(&mut stop, tick);
        let stopped = *stop;
        drop(stop);
        if stopped {
            return;
        }
        if result.timed_out() {
            let elapsed = last_flush.elapsed() >= interval;
            let over_budget = config.max_bytes > 0 && pending_bytes() >= config.max_bytes;
            if elapsed || over_budget {
                trace!("autosync: flushing (elapsed={elapsed} over_budget={over_budget})");
                flush();
                last_flush = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn flushes_on_byte_threshold_quickly() {
        let pending = Arc::new(AtomicU64::new(0));
        let flushed = Arc::new(AtomicU64::new(0));

        let p = Arc::clone(&pending);
        let f = Arc::clone(&flushed);
        let autosync = Autosync::start(
            AutosyncConfig {
                max_seconds: 3600,
                max_bytes: 100,
            },
            move || p.load(Ordering::SeqCst),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );

        pending.store(200, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while flushed.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(flushed.load(Ordering::SeqCst) >= 1);
        autosync.stop();
    }

    #[test]
    fn stop_joins_the_worker_thread() {
        let autosync = Autosync::start(
            AutosyncConfig {
                max_seconds: 3600,
                max_bytes: 0,
            },
            || 0,
            || {},
        );
        autosync.stop();
    }
}
