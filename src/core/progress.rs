use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::scanner::ScanStatus;
use crate::database::models::ScanPhase;

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub processed: usize,
    pub total: usize,
}

/// Observer for scan progress. Every method has a no-op default.
pub trait ProgressReporter: Send + Sync {
    fn on_phase_start(&self, _phase: ScanPhase, _total: usize) {}
    fn on_progress(&self, _progress: &ScanProgress) {}
    fn on_phase_complete(&self, _phase: ScanPhase) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Messages a background scan sends to its owner.
#[derive(Debug, Clone, Serialize)]
pub enum ScanEvent {
    Progress(ScanProgress),
    Finished(ScanStatus),
}

/// Forwards progress into an unbounded channel. A dropped receiver is ignored.
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelReporter {
    pub fn new(sender: mpsc::UnboundedSender<ScanEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_phase_start(&self, phase: ScanPhase, total: usize) {
        let _ = self.sender.send(ScanEvent::Progress(ScanProgress {
            phase,
            processed: 0,
            total,
        }));
    }

    fn on_progress(&self, progress: &ScanProgress) {
        let _ = self.sender.send(ScanEvent::Progress(*progress));
    }
}
