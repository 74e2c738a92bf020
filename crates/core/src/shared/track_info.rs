use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// One elementary stream inside a source asset.
///
/// Video-only and audio-only attributes are zero for the other kind.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    /// Clockwise display rotation in degrees: 0, 90, 180 or 270.
    pub rotation: i32,
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl TrackInfo {
    pub fn video(index: usize, width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            index,
            kind: MediaKind::Video,
            width,
            height,
            rotation: 0,
            frame_rate,
            sample_rate: 0,
            channels: 0,
        }
    }

    pub fn audio(index: usize, sample_rate: u32, channels: u16) -> Self {
        Self {
            index,
            kind: MediaKind::Audio,
            width: 0,
            height: 0,
            rotation: 0,
            frame_rate: 0.0,
            sample_rate,
            channels,
        }
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn natural_size(&self) -> Option<(u32, u32)> {
        match self.kind {
            MediaKind::Video => Some((self.width, self.height)),
            MediaKind::Audio => None,
        }
    }
}

/// What a demux session learned about its asset when it was opened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssetInfo {
    pub duration_secs: f64,
    pub tracks: Vec<TrackInfo>,
}

impl AssetInfo {
    /// First track of the given kind, in container order.
    pub fn first_track(&self, kind: MediaKind) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}
