use crate::shared::track_info::MediaKind;

/// Decoded picture in planar YUV 4:2:0, planes packed back to back
/// (Y, then U, then V) with no row padding.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoPlanes {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl VideoPlanes {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(
            data.len(),
            Self::packed_len(width, height),
            "data length must match YUV 4:2:0 layout"
        );
        Self {
            data,
            width,
            height,
        }
    }

    /// Bytes needed for a packed YUV 4:2:0 picture of this size.
    pub fn packed_len(width: u32, height: u32) -> usize {
        let (cw, ch) = Self::chroma_size(width, height);
        (width as usize) * (height as usize) + 2 * (cw as usize) * (ch as usize)
    }

    /// Chroma planes round up for odd dimensions.
    pub fn chroma_size(width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(2), height.div_ceil(2))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns plane `index` (0 = Y, 1 = U, 2 = V) and its row width.
    pub fn plane(&self, index: usize) -> (&[u8], usize) {
        let luma = (self.width as usize) * (self.height as usize);
        let (cw, ch) = Self::chroma_size(self.width, self.height);
        let chroma = (cw as usize) * (ch as usize);
        match index {
            0 => (&self.data[..luma], self.width as usize),
            1 => (&self.data[luma..luma + chroma], cw as usize),
            _ => (&self.data[luma + chroma..luma + 2 * chroma], cw as usize),
        }
    }
}

/// Interleaved 32-bit float linear PCM.
#[derive(Clone, Debug, PartialEq)]
pub struct PcmSamples {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl PcmSamples {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        debug_assert!(channels > 0, "channels must be positive");
        debug_assert_eq!(
            samples.len() % channels as usize,
            0,
            "sample count must be a multiple of the channel count"
        );
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SamplePayload {
    Video(VideoPlanes),
    Audio(PcmSamples),
}

/// One decoded, timestamped unit of media for a single track.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    timestamp: f64,
    payload: SamplePayload,
}

impl SampleBuffer {
    pub fn video(timestamp: f64, planes: VideoPlanes) -> Self {
        Self {
            timestamp,
            payload: SamplePayload::Video(planes),
        }
    }

    pub fn audio(timestamp: f64, pcm: PcmSamples) -> Self {
        Self {
            timestamp,
            payload: SamplePayload::Audio(pcm),
        }
    }

    /// Presentation time in seconds, relative to the start of the track.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn kind(&self) -> MediaKind {
        match self.payload {
            SamplePayload::Video(_) => MediaKind::Video,
            SamplePayload::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn payload(&self) -> &SamplePayload {
        &self.payload
    }

    pub fn into_payload(self) -> SamplePayload {
        self.payload
    }
}
