//! Traffic counters shared between reactor threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Anything that tracks bytes flowing to and from a remote peer.
pub trait NetFlowRecorder: Send + Sync {
    /// Record bytes received from the remote side.
    fn inc_from_remote_bytes(&self, bytes: u64);

    /// Record bytes sent to the remote side.
    fn inc_to_remote_bytes(&self, bytes: u64);
}

/// Lock-free additive byte counters.
#[derive(Debug, Default)]
pub struct FlowStats {
    from_remote_bytes: AtomicU64,
    to_remote_bytes: AtomicU64,
}

impl FlowStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_remote_bytes(&self) -> u64 {
        self.from_remote_bytes.load(Ordering::Relaxed)
    }

    pub fn to_remote_bytes(&self) -> u64 {
        self.to_remote_bytes.load(Ordering::Relaxed)
    }
}

impl NetFlowRecorder for FlowStats {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.from_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.to_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}
