use crate::media::domain::demux_session::MediaError;
use crate::shared::sample_buffer::SampleBuffer;
use crate::shared::track_info::MediaKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MuxStatus {
    NotStarted,
    Writing,
    Finished,
    Cancelled,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Cover the target size and crop the overflow.
    #[default]
    AspectFill,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoEncodeSettings {
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Display rotation carried over from the source, in degrees.
    pub rotation: i32,
    pub scaling: ScalingMode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioEncodeSettings {
    pub bitrate: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// H.264 video or AAC audio.
#[derive(Clone, Debug, PartialEq)]
pub enum EncodeSettings {
    H264(VideoEncodeSettings),
    Aac(AudioEncodeSettings),
}

impl EncodeSettings {
    pub fn kind(&self) -> MediaKind {
        match self {
            EncodeSettings::H264(_) => MediaKind::Video,
            EncodeSettings::Aac(_) => MediaKind::Audio,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxOptions {
    /// Place the index at the front of the file so playback can start
    /// before the whole file has downloaded.
    pub network_optimized: bool,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            network_optimized: true,
        }
    }
}

/// Push handle over one encoded track.
pub trait TrackInput: Send {
    fn kind(&self) -> MediaKind;

    /// Whether `append` would accept a sample without waiting.
    fn is_ready_for_more(&self) -> bool;

    /// Suspends the caller until the input is ready for more data, then
    /// queues `sample`. Fails once the session stops accepting samples.
    ///
    /// This wait is the backpressure: callers never queue past a busy input.
    fn append(&mut self, sample: SampleBuffer) -> Result<(), MediaError>;

    /// No more samples will follow. Idempotent.
    fn mark_finished(&mut self);
}

/// Sequential writer producing one container file.
///
/// Inputs must be added before `start_writing`.
pub trait MuxSession: Send {
    fn add_input(&mut self, settings: &EncodeSettings) -> Result<Box<dyn TrackInput>, MediaError>;

    /// Starts the session; sample timestamps are measured from `origin` seconds.
    fn start_writing(&mut self, origin: f64) -> Result<(), MediaError>;

    fn status(&self) -> MuxStatus;

    /// Waits for every input to be marked finished, then finalizes the file.
    fn finish_writing(&mut self) -> Result<(), MediaError>;

    /// Abandons the file without finalizing it.
    fn cancel_writing(&mut self);
}
