use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::shared::constants::DEFAULT_VIDEO_BITRATE;
use crate::shared::progress::ProgressSink;

/// Per-call settings for one compress operation.
#[derive(Clone)]
pub struct CompressOptions {
    /// Opaque tag echoed back with every progress report.
    pub identifier: Option<String>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Target H.264 bitrate in bits per second.
    pub bitrate: u64,
    /// Set to request early termination; checked between samples.
    pub cancelled: Arc<AtomicBool>,
}

impl CompressOptions {
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            identifier: None,
            progress: None,
            bitrate: DEFAULT_VIDEO_BITRATE,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl std::fmt::Debug for CompressOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressOptions")
            .field("identifier", &self.identifier)
            .field("progress", &self.progress.is_some())
            .field("bitrate", &self.bitrate)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
