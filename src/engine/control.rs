use std::sync::atomic::{AtomicBool, Ordering};

/// Commands an embedder can send to a running load test.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Graceful stop: VUs finish their current iteration, then the run drains.
    Stop,
}

/// Shared run-wide stop flag between the controller and its VUs.
///
/// VUs consult it only at iteration boundaries; mid-request work is never
/// interrupted by it.
pub struct ControlState {
    stopped: AtomicBool,
}

impl ControlState {
    pub fn new() -> Self {
        Self { stopped: AtomicBool::new(false) }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_state_stop() {
        let state = ControlState::new();
        assert!(!state.is_stopped());
        state.stop();
        assert!(state.is_stopped());
        // stop is idempotent
        state.stop();
        assert!(state.is_stopped());
    }
}
