//! Contract for the operating-system focus hook. This crate compiles no platform
//! backend of its own; embedders register one and tests use the generated mock.

use std::sync::Arc;

use anyhow::{bail, Result};
#[cfg(test)]
use mockall::automock;

/// A single observation of the foreground window.
#[derive(Debug, Clone)]
pub struct FocusSample {
    /// Name of the window. For example 'bash in hello' or 'Document 1' or
    /// 'Vibing in YouTube - Chrome'
    pub window_title: Arc<str>,
    /// Full path to an executable. For example /home/etc/nvim
    pub process_name: Arc<str>,
}

/// Intended to serve as the contract platform focus hooks must implement.
#[cfg_attr(test, automock)]
pub trait FocusProbe: Send {
    fn sample(&mut self) -> Result<FocusSample>;

    /// Retrieve amount of time user has been inactive in milliseconds
    fn idle_time_ms(&mut self) -> Result<u64>;
}

/// Serves as the cross-platform probe entry point.
pub struct GenericFocusProbe {
    inner: Box<dyn FocusProbe>,
}

impl GenericFocusProbe {
    pub fn new() -> Result<Self> {
        // Platform hooks live with the embedding application, not here. The
        // runtime error keeps the rest of the crate usable without one.
        bail!("no focus probe backend is available in this build")
    }
}

impl FocusProbe for GenericFocusProbe {
    fn sample(&mut self) -> Result<FocusSample> {
        self.inner.sample()
    }

    fn idle_time_ms(&mut self) -> Result<u64> {
        self.inner.idle_time_ms()
    }
}
