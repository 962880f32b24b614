//! Termination signals shared between stages.
//!
//! A [`Liveness`] counter holds how many workers of one stage are still
//! running. Downstream stages poll it to decide whether to keep waiting for
//! input; it reaching zero is the only shutdown signal they get. The
//! [`StopFlag`] is the orchestrator's one-way switch that asks a source
//! stage to stop requesting new work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Continuation precondition a stage checks before pulling more work.
pub trait Upstream: Send + Sync + fmt::Debug {
    /// `true` while the stage should keep waiting for (or requesting) work.
    fn is_live(&self) -> bool;
}

/// Count of still-running workers in one stage.
#[derive(Clone, Default)]
pub struct Liveness {
    alive: Arc<AtomicUsize>,
}

impl Liveness {
    pub fn new(workers: usize) -> Self {
        Self {
            alive: Arc::new(AtomicUsize::new(workers)),
        }
    }

    /// Reset the counter; must happen before any worker starts.
    pub fn set(&self, workers: usize) {
        self.alive.store(workers, Ordering::SeqCst);
    }

    /// Record one worker exit and return the remaining count.
    ///
    /// Saturates at zero.
    pub fn decrement(&self) -> usize {
        match self
            .alive
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn read(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_zero(&self) -> bool {
        self.read() == 0
    }
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Liveness").field(&self.read()).finish()
    }
}

impl Upstream for Liveness {
    fn is_live(&self) -> bool {
        self.read() > 0
    }
}

/// Decrements a [`Liveness`] exactly once when dropped.
///
/// Each worker holds one for its whole lifetime, so the count goes down on
/// every exit path, unwinding included.
#[derive(Debug)]
pub(crate) struct WorkerGuard {
    liveness: Liveness,
    worker: String,
}

impl WorkerGuard {
    pub(crate) fn new(liveness: Liveness, worker: String) -> Self {
        Self { liveness, worker }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let remaining = self.liveness.decrement();
        tracing::debug!(worker = %self.worker, remaining, "Worker exited");
    }
}

/// Orchestrator-owned request for a source stage to stop.
#[derive(Clone, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `false` if it was already raised.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StopFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopFlag")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Upstream for StopFlag {
    fn is_live(&self) -> bool {
        !self.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrement_never_goes_negative() {
        let liveness = Liveness::new(2);
        assert_eq!(liveness.decrement(), 1);
        assert_eq!(liveness.decrement(), 0);
        assert_eq!(liveness.decrement(), 0);
        assert!(liveness.is_zero());
        assert!(!liveness.is_live());
    }

    #[test]
    fn test_clones_share_count() {
        let liveness = Liveness::new(0);
        let handle = liveness.clone();
        liveness.set(3);
        assert_eq!(handle.read(), 3);
        handle.decrement();
        assert_eq!(liveness.read(), 2);
    }

    #[test]
    fn test_guard_decrements_once_on_drop() {
        let liveness = Liveness::new(1);
        {
            let _guard = WorkerGuard::new(liveness.clone(), "w0".to_string());
            assert_eq!(liveness.read(), 1);
        }
        assert_eq!(liveness.read(), 0);
    }

    #[test]
    fn test_guard_decrements_on_unwind() {
        let liveness = Liveness::new(1);
        let handle = liveness.clone();
        let res = std::panic::catch_unwind(move || {
            let _guard = WorkerGuard::new(handle, "w0".to_string());
            panic!("worker blew up");
        });
        assert!(res.is_err());
        assert_eq!(liveness.read(), 0);
    }

    #[test]
    fn test_concurrent_decrements() {
        let liveness = Liveness::new(8);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let l = liveness.clone();
                std::thread::spawn(move || {
                    l.decrement();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(liveness.read(), 0);
    }

    #[test]
    fn test_stop_flag_is_idempotent() {
        let flag = StopFlag::new();
        assert!(flag.is_live());
        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(flag.is_stopped());
        assert!(!flag.is_live());
    }
}
