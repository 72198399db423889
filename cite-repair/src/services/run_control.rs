//! Cooperative pause/stop flags
//!
//! Long-running loops call [`RunControl::gate`] at their safe points (phase
//! boundary, batch boundary). In-flight work is never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outcome of a safe-point check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Stop,
}

#[derive(Debug)]
pub struct RunControl {
    paused: AtomicBool,
    stopped: AtomicBool,
    poll_interval: Duration,
}

impl RunControl {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            poll_interval,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Clear both flags before a new run
    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Block while paused; report whether the caller may continue
    pub async fn gate(&self) -> Gate {
        let mut logged = false;
        loop {
            if self.is_stopped() {
                return Gate::Stop;
            }
            if !self.is_paused() {
                return Gate::Proceed;
            }
            if !logged {
                tracing::info!("Run paused, waiting for resume");
                logged = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}
