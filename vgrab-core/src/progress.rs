use std::sync::Mutex;

/// Phase of the acquisition flow a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Download,
    Upload,
}

/// Listener for coalesced progress updates (integer percent, 0..=100).
/// Downstream consumers can be slow (chat-message edits), so updates are
/// throttled before they reach a sink.
pub trait ProgressSink: Send + Sync {
    fn update(&self, stage: ProgressStage, percent: u8);
}

/// Sink that discards everything.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&self, _stage: ProgressStage, _percent: u8) {}
}

/// Coalesces updates to a minimum delta. The terminal 100 always passes,
/// exactly once.
pub struct ProgressThrottle {
    min_delta: u8,
    last: Mutex<Option<u8>>,
}

impl ProgressThrottle {
    pub fn new(min_delta: u8) -> Self {
        Self {
            min_delta: min_delta.max(1),
            last: Mutex::new(None),
        }
    }

    /// Returns true when this update should be forwarded.
    pub fn accept(&self, percent: u8) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return false;
        };
        let forward = match *last {
            None => true,
            Some(100) => false,
            Some(previous) => percent == 100 || percent >= previous.saturating_add(self.min_delta),
        };
        if forward {
            *last = Some(percent);
        }
        forward
    }

    /// Returns true when the terminal 100 has not been forwarded yet;
    /// callers emit it themselves on completion so it is never dropped.
    pub fn finish(&self) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return false;
        };
        if *last == Some(100) {
            false
        } else {
            *last = Some(100);
            true
        }
    }
}
