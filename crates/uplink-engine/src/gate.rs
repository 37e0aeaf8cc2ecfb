//! Resolution-change gate.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

/// Holds back delta frames after a resolution switch.
///
/// While armed, only key units pass. The owner clears the gate once a key
/// unit has been accepted for sending.
#[derive(Debug, Default)]
pub struct ResolutionGate {
    pending: AtomicBool,
}

impl ResolutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start discarding delta frames.
    pub fn arm(&self) {
        if !self.pending.swap(true, Ordering::SeqCst) {
            debug!("Resolution gate armed");
        }
    }

    /// Whether a video frame may pass.
    pub fn admits(&self, is_key_unit: bool) -> bool {
        is_key_unit || !self.pending.load(Ordering::SeqCst)
    }

    /// Let every frame through again.
    pub fn clear(&self) {
        if self.pending.swap(false, Ordering::SeqCst) {
            debug!("Resolution gate cleared");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_gate_admits_everything() {
        let gate = ResolutionGate::new();
        assert!(gate.admits(false));
        assert!(gate.admits(true));
    }

    #[test]
    fn test_armed_gate_admits_only_key_units() {
        let gate = ResolutionGate::new();
        gate.arm();
        assert!(!gate.admits(false));
        assert!(gate.admits(true));
        assert!(gate.is_armed());

        gate.clear();
        assert!(gate.admits(false));
    }
}
