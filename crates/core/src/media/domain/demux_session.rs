use std::sync::{Arc, Mutex};

use crate::shared::sample_buffer::SampleBuffer;
use crate::shared::track_info::{AssetInfo, TrackInfo};

/// Boxed error used across the media backend seam.
pub type MediaError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DemuxStatus {
    NotStarted,
    Reading,
    Completed,
    Failed(String),
    Cancelled,
}

impl DemuxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DemuxStatus::Completed | DemuxStatus::Failed(_) | DemuxStatus::Cancelled
        )
    }
}

/// Shared view of a demux session's status.
///
/// Copy loops hold clones so they can inspect the session after their
/// track output runs dry, without owning the session.
#[derive(Clone, Debug)]
pub struct DemuxStatusHandle(Arc<Mutex<DemuxStatus>>);

impl DemuxStatusHandle {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(DemuxStatus::NotStarted)))
    }

    pub fn get(&self) -> DemuxStatus {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, status: DemuxStatus) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Moves to `status` unless a terminal status was already recorded.
    pub fn finish(&self, status: DemuxStatus) {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !current.is_terminal() {
            *current = status;
        }
    }
}

impl Default for DemuxStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded format a track output should deliver.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputSettings {
    /// Planar YUV 4:2:0 at the track's natural size.
    Yuv420p,
    /// Interleaved 32-bit float linear PCM.
    LinearPcm { sample_rate: u32, channels: u16 },
}

/// Pull handle over one decoded track.
pub trait TrackOutput: Send {
    fn track(&self) -> &TrackInfo;

    /// Blocks until the next sample is decoded. `None` marks the end of the
    /// track, either because it is exhausted or because the session stopped;
    /// the session status tells which.
    fn next_sample(&mut self) -> Option<SampleBuffer>;
}

/// Sequential reader over one source asset.
///
/// Outputs must be attached before `start_reading`.
pub trait DemuxSession: Send {
    fn asset_info(&self) -> &AssetInfo;

    fn add_output(
        &mut self,
        track: &TrackInfo,
        settings: &OutputSettings,
    ) -> Result<Box<dyn TrackOutput>, MediaError>;

    fn start_reading(&mut self) -> Result<(), MediaError>;

    fn status(&self) -> DemuxStatusHandle;

    /// Stops reading. Pending and future `next_sample` calls return `None`.
    fn cancel_reading(&mut self);
}
