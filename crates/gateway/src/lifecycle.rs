//! Lifecycle contract shared by every transport.
//!
//! ```text
//! uninitialized ──init()──▶ initialized ──start()──▶ started
//!       ▲                                               │
//!       └──────────── finalize() ◀──── stop() ◀─────────┘
//! ```
//!
//! `start()` on a disabled transport does nothing. `stop()` is safe before
//! `start()` and safe to repeat; it always ends in `finalize()`, which drops
//! every per-instance resource so the next `start()` begins from scratch.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::GatewayError;

#[async_trait]
pub trait Service: Send + Sync {
    /// Short name used in logs and status reports.
    fn name(&self) -> &'static str;

    /// Whether configuration turns this transport on.
    fn enabled(&self) -> bool;

    /// Allocate fresh resources, discarding any left from a previous run.
    fn init(&self);

    async fn start(&self) -> Result<(), GatewayError>;

    async fn stop(&self);

    /// Drop owned handles and clear the state flags.
    fn finalize(&self);

    /// A disabled transport is never reported as failed.
    fn good(&self) -> bool;

    /// Periodic liveness probe run by the supervisor.
    async fn heartbeat(&self) -> bool {
        true
    }
}

/// `initialized` / `started` pair, updated from control and server tasks.
#[derive(Debug, Default)]
pub struct ServiceFlags {
    initialized: AtomicBool,
    started: AtomicBool,
}

impl ServiceFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::SeqCst);
    }

    pub fn set_started(&self, value: bool) {
        self.started.store(value, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.set_started(false);
        self.set_initialized(false);
    }

    /// `initialized && started` when enabled, otherwise always good.
    pub fn good(&self, enabled: bool) -> bool {
        !enabled || (self.is_initialized() && self.is_started())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_is_always_good() {
        let flags = ServiceFlags::new();
        assert!(flags.good(false));
        assert!(!flags.good(true));
    }

    #[test]
    fn good_requires_both_flags() {
        let flags = ServiceFlags::new();
        flags.set_initialized(true);
        assert!(!flags.good(true));
        flags.set_started(true);
        assert!(flags.good(true));
        flags.reset();
        assert!(!flags.is_initialized());
        assert!(!flags.good(true));
    }
}
