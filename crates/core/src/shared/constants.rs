/// Average video bitrate used when the caller does not pick one.
pub const DEFAULT_VIDEO_BITRATE: u64 = 6_000_000;

pub const AUDIO_BITRATE: u64 = 128_000;
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const AUDIO_CHANNELS: u16 = 2;

/// Extension given to materialized copies of source assets.
pub const MATERIALIZED_EXTENSION: &str = "mov";
pub const MATERIALIZED_PREFIX: &str = "asset-";

pub const OUTPUT_EXTENSION: &str = "mp4";
pub const OUTPUT_PREFIX: &str = "compressed-";

/// Bounded queue depth between the demuxer, the copy loops and the muxer.
pub const TRACK_QUEUE_CAPACITY: usize = 8;

/// Time base denominator for encoded video timestamps.
pub const VIDEO_TIME_BASE: i32 = 90_000;

/// Frame rate assumed when a source stream does not declare one.
pub const FALLBACK_FRAME_RATE: f64 = 30.0;
