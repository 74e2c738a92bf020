use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::media::domain::demux_session::{
    DemuxSession, DemuxStatus, DemuxStatusHandle, MediaError, OutputSettings, TrackOutput,
};
use crate::shared::constants::{FALLBACK_FRAME_RATE, TRACK_QUEUE_CAPACITY};
use crate::shared::sample_buffer::{PcmSamples, SampleBuffer, SamplePayload, VideoPlanes};
use crate::shared::track_info::{AssetInfo, MediaKind, TrackInfo};

const NO_PTS: i64 = i64::MIN;
const AV_TIME_BASE: f64 = 1_000_000.0;

/// Wraps the input context so it can move into the reader thread.
struct SendInput(ffmpeg_next::format::context::Input);

// Safety: the input context is only touched by the opening thread until
// `start_reading`, then exclusively by the reader thread.
unsafe impl Send for SendInput {}

struct PendingOutput {
    track: TrackInfo,
    settings: OutputSettings,
    tx: Sender<SampleBuffer>,
}

/// Demuxes and decodes an asset with ffmpeg-next on a background thread.
///
/// Each attached output gets its own bounded channel, so a slow consumer
/// on one track only stalls the reader once that track's queue is full.
pub struct FfmpegDemuxSession {
    path: PathBuf,
    input: Option<SendInput>,
    info: AssetInfo,
    pending: Vec<PendingOutput>,
    status: DemuxStatusHandle,
    cancelled: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl FfmpegDemuxSession {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        ffmpeg_next::init()?;

        let ictx = ffmpeg_next::format::input(&path)?;
        let info = probe(&ictx)?;
        log::debug!(
            "Opened {} ({:.2}s, {} tracks)",
            path.display(),
            info.duration_secs,
            info.tracks.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            input: Some(SendInput(ictx)),
            info,
            pending: Vec::new(),
            status: DemuxStatusHandle::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }
}

impl DemuxSession for FfmpegDemuxSession {
    fn asset_info(&self) -> &AssetInfo {
        &self.info
    }

    fn add_output(
        &mut self,
        track: &TrackInfo,
        settings: &OutputSettings,
    ) -> Result<Box<dyn TrackOutput>, MediaError> {
        if self.status.get() != DemuxStatus::NotStarted {
            return Err("outputs must be attached before reading starts".into());
        }
        let known = self
            .info
            .tracks
            .iter()
            .find(|t| t.index == track.index && t.kind == track.kind)
            .ok_or_else(|| format!("stream {} is not a {} track", track.index, track.kind))?;
        if self.pending.iter().any(|p| p.track.index == track.index) {
            return Err(format!("stream {} already has an output", track.index).into());
        }
        let compatible = matches!(
            (known.kind, settings),
            (MediaKind::Video, OutputSettings::Yuv420p)
                | (MediaKind::Audio, OutputSettings::LinearPcm { .. })
        );
        if !compatible {
            return Err(format!("{settings:?} cannot decode a {} track", known.kind).into());
        }
        if let OutputSettings::LinearPcm { sample_rate: 0, .. }
        | OutputSettings::LinearPcm { channels: 0, .. } = settings
        {
            return Err("linear PCM output needs a sample rate and channel count".into());
        }

        let (tx, rx) = crossbeam_channel::bounded(TRACK_QUEUE_CAPACITY);
        self.pending.push(PendingOutput {
            track: known.clone(),
            settings: settings.clone(),
            tx,
        });

        Ok(Box::new(ChannelTrackOutput {
            track: known.clone(),
            rx,
        }))
    }

    fn start_reading(&mut self) -> Result<(), MediaError> {
        if self.status.get() != DemuxStatus::NotStarted {
            return Err("reading already started".into());
        }
        let input = self.input.take().ok_or("FfmpegDemuxSession: not opened")?;

        let outputs = std::mem::take(&mut self.pending);
        let status = self.status.clone();
        let cancelled = self.cancelled.clone();
        let duration = self.info.duration_secs;

        status.set(DemuxStatus::Reading);
        let handle = std::thread::Builder::new()
            .name("demux".to_string())
            .spawn(move || run_reader(input, outputs, &status, &cancelled, duration));

        match handle {
            Ok(handle) => {
                self.reader = Some(handle);
                log::debug!("Reading {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                self.status.set(DemuxStatus::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn status(&self) -> DemuxStatusHandle {
        self.status.clone()
    }

    fn cancel_reading(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if self.reader.is_none() {
            self.input = None;
            self.pending.clear();
            self.status.finish(DemuxStatus::Cancelled);
        }
    }
}

impl Drop for FfmpegDemuxSession {
    fn drop(&mut self) {
        if !self.status.get().is_terminal() {
            self.cancel_reading();
        }
        if let Some(handle) = self.reader.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

struct ChannelTrackOutput {
    track: TrackInfo,
    rx: Receiver<SampleBuffer>,
}

impl TrackOutput for ChannelTrackOutput {
    fn track(&self) -> &TrackInfo {
        &self.track
    }

    fn next_sample(&mut self) -> Option<SampleBuffer> {
        self.rx.recv().ok()
    }
}

/// Builds `AssetInfo` from the container's streams.
fn probe(ictx: &ffmpeg_next::format::context::Input) -> Result<AssetInfo, MediaError> {
    let mut tracks = Vec::new();
    let mut longest_stream = 0.0f64;

    for stream in ictx.streams() {
        let tb = stream.time_base();
        if stream.duration() > 0 && tb.denominator() != 0 {
            let secs = stream.duration() as f64 * f64::from(tb);
            longest_stream = longest_stream.max(secs);
        }

        match stream.parameters().medium() {
            ffmpeg_next::media::Type::Video => {
                let codec_ctx =
                    ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
                let decoder = codec_ctx.decoder().video()?;
                tracks.push(
                    TrackInfo::video(
                        stream.index(),
                        decoder.width(),
                        decoder.height(),
                        frame_rate(&stream),
                    )
                    .with_rotation(extract_rotation(&stream)),
                );
            }
            ffmpeg_next::media::Type::Audio => {
                let codec_ctx =
                    ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
                let decoder = codec_ctx.decoder().audio()?;
                tracks.push(TrackInfo::audio(
                    stream.index(),
                    decoder.rate(),
                    decoder.channels(),
                ));
            }
            _ => {}
        }
    }

    let container = ictx.duration();
    let duration_secs = if container > 0 {
        container as f64 / AV_TIME_BASE
    } else {
        longest_stream
    };

    Ok(AssetInfo {
        duration_secs,
        tracks,
    })
}

fn frame_rate(stream: &ffmpeg_next::format::stream::Stream) -> f64 {
    for rate in [stream.avg_frame_rate(), stream.rate()] {
        if rate.numerator() > 0 && rate.denominator() > 0 {
            return f64::from(rate);
        }
    }
    FALLBACK_FRAME_RATE
}

/// Extracts the rotation angle from a video stream.
///
/// Tries stream side data (DisplayMatrix) first, then falls back to the
/// `"rotate"` metadata tag. Returns 0, 90, 180, or 270.
fn extract_rotation(stream: &ffmpeg_next::format::stream::Stream) -> i32 {
    for side_data in stream.side_data() {
        if side_data.kind() == ffmpeg_next::codec::packet::side_data::Type::DisplayMatrix {
            if let Some(angle) = parse_display_matrix(side_data.data()) {
                return normalize_rotation(angle);
            }
        }
    }

    if let Some(rotate) = stream.metadata().get("rotate") {
        if let Ok(angle) = rotate.parse::<i32>() {
            return normalize_rotation(angle);
        }
    }

    0
}

/// Parses a 3x3 display matrix (9 x i32, 16.16 fixed-point) into clockwise
/// degrees, the same direction as the `"rotate"` tag.
pub(crate) fn parse_display_matrix(data: &[u8]) -> Option<i32> {
    if data.len() < 36 {
        return None;
    }

    let a = i32::from_ne_bytes(data[0..4].try_into().ok()?) as f64 / 65536.0;
    let b = i32::from_ne_bytes(data[4..8].try_into().ok()?) as f64 / 65536.0;

    Some(b.atan2(a).to_degrees().round() as i32)
}

fn normalize_rotation(angle: i32) -> i32 {
    match angle.rem_euclid(360) {
        45..=134 => 90,
        135..=224 => 180,
        225..=315 => 270,
        _ => 0,
    }
}

/// Why the reader stopped without error.
enum ReadEnd {
    Exhausted,
    Cancelled,
}

fn run_reader(
    input: SendInput,
    outputs: Vec<PendingOutput>,
    status: &DemuxStatusHandle,
    cancelled: &AtomicBool,
    duration: f64,
) {
    let SendInput(mut ictx) = input;
    let mut routes = Vec::with_capacity(outputs.len());
    for output in outputs {
        match Route::new(&ictx, output) {
            Ok(route) => routes.push(route),
            Err(e) => {
                status.finish(DemuxStatus::Failed(e.to_string()));
                return;
            }
        }
    }

    let outcome = read_packets(&mut ictx, &mut routes, cancelled);

    // Status must be final before the channels close.
    match outcome {
        Ok(ReadEnd::Exhausted) => {
            log::debug!("Demux finished ({duration:.2}s asset)");
            status.finish(DemuxStatus::Completed);
        }
        Ok(ReadEnd::Cancelled) => status.finish(DemuxStatus::Cancelled),
        Err(e) => {
            log::warn!("Demux failed: {e}");
            status.finish(DemuxStatus::Failed(e.to_string()));
        }
    }
    drop(routes);
}

fn read_packets(
    ictx: &mut ffmpeg_next::format::context::Input,
    routes: &mut [Route],
    cancelled: &AtomicBool,
) -> Result<ReadEnd, MediaError> {
    for (stream, packet) in ictx.packets() {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(ReadEnd::Cancelled);
        }

        let index = stream.index();
        if let Some(route) = routes.iter_mut().find(|r| r.stream_index == index) {
            route.decode_packet(&packet)?;
        }

        if !routes.is_empty() && routes.iter().all(|r| r.tx.is_none()) {
            return Ok(ReadEnd::Cancelled);
        }
    }

    if cancelled.load(Ordering::Relaxed) {
        return Ok(ReadEnd::Cancelled);
    }
    for route in routes.iter_mut() {
        route.flush()?;
    }
    Ok(ReadEnd::Exhausted)
}

enum Converter {
    Video {
        decoder: ffmpeg_next::decoder::Video,
        scaler: Option<ffmpeg_next::software::scaling::Context>,
        width: u32,
        height: u32,
    },
    Audio {
        decoder: ffmpeg_next::decoder::Audio,
        resampler: Option<ffmpeg_next::software::resampling::Context>,
        sample_rate: u32,
        channels: u16,
    },
}

/// One selected stream: its decoder, its converter, and its consumer.
struct Route {
    stream_index: usize,
    converter: Converter,
    tx: Option<Sender<SampleBuffer>>,
    time_base: f64,
    start: i64,
    frame_step: f64,
    next_estimate: f64,
}

impl Route {
    fn new(
        ictx: &ffmpeg_next::format::context::Input,
        output: PendingOutput,
    ) -> Result<Self, MediaError> {
        let stream = ictx
            .stream(output.track.index)
            .ok_or_else(|| format!("stream {} disappeared", output.track.index))?;
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;

        let frame_step = if output.track.frame_rate > 0.0 {
            1.0 / output.track.frame_rate
        } else {
            1.0 / FALLBACK_FRAME_RATE
        };

        let converter = match output.settings {
            OutputSettings::Yuv420p => Converter::Video {
                decoder: codec_ctx.decoder().video()?,
                scaler: None,
                width: output.track.width,
                height: output.track.height,
            },
            OutputSettings::LinearPcm {
                sample_rate,
                channels,
            } => Converter::Audio {
                decoder: codec_ctx.decoder().audio()?,
                resampler: None,
                sample_rate,
                channels,
            },
        };

        Ok(Self {
            stream_index: output.track.index,
            converter,
            tx: Some(output.tx),
            time_base: f64::from(stream.time_base()),
            start: stream.start_time(),
            frame_step,
            next_estimate: 0.0,
        })
    }

    fn decode_packet(&mut self, packet: &ffmpeg_next::Packet) -> Result<(), MediaError> {
        if self.tx.is_none() {
            return Ok(());
        }
        let sent = match &mut self.converter {
            Converter::Video { decoder, .. } => decoder.send_packet(packet),
            Converter::Audio { decoder, .. } => decoder.send_packet(packet),
        };
        if let Err(e) = sent {
            log::debug!("Skipping undecodable packet on stream {}: {e}", self.stream_index);
            return Ok(());
        }
        self.drain()
    }

    fn flush(&mut self) -> Result<(), MediaError> {
        if self.tx.is_none() {
            return Ok(());
        }
        match &mut self.converter {
            Converter::Video { decoder, .. } => decoder.send_eof()?,
            Converter::Audio { decoder, .. } => decoder.send_eof()?,
        }
        self.drain()?;
        self.flush_resampler()
    }

    /// Receives every frame the decoder has ready and forwards it.
    fn drain(&mut self) -> Result<(), MediaError> {
        loop {
            let (timestamp, payload) = match &mut self.converter {
                Converter::Video {
                    decoder,
                    scaler,
                    width,
                    height,
                } => {
                    let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
                    if decoder.receive_frame(&mut decoded).is_err() {
                        return Ok(());
                    }
                    let planes = convert_video(&decoded, scaler, *width, *height)?;
                    let ts = seconds(decoded.timestamp(), self.start, self.time_base);
                    (ts, SamplePayload::Video(planes))
                }
                Converter::Audio {
                    decoder,
                    resampler,
                    sample_rate,
                    channels,
                } => {
                    let mut decoded = ffmpeg_next::util::frame::audio::Audio::empty();
                    if decoder.receive_frame(&mut decoded).is_err() {
                        return Ok(());
                    }
                    let pcm = convert_audio(&mut decoded, resampler, *sample_rate, *channels)?;
                    if pcm.frames() == 0 {
                        continue;
                    }
                    let ts = seconds(decoded.timestamp(), self.start, self.time_base);
                    (ts, SamplePayload::Audio(pcm))
                }
            };
            self.forward(timestamp, payload);
        }
    }

    fn flush_resampler(&mut self) -> Result<(), MediaError> {
        let Converter::Audio {
            resampler: Some(resampler),
            sample_rate,
            channels,
            ..
        } = &mut self.converter
        else {
            return Ok(());
        };
        let (sample_rate, channels) = (*sample_rate, *channels);
        let mut out = ffmpeg_next::util::frame::audio::Audio::empty();
        let delayed = matches!(resampler.flush(&mut out), Ok(Some(_))) && out.samples() > 0;
        if delayed {
            let pcm = PcmSamples::new(packed_f32(&out, channels), sample_rate, channels);
            self.forward(None, SamplePayload::Audio(pcm));
        }
        Ok(())
    }

    fn forward(&mut self, timestamp: Option<f64>, payload: SamplePayload) {
        let timestamp = timestamp.unwrap_or(self.next_estimate);
        let sample = match payload {
            SamplePayload::Video(planes) => {
                self.next_estimate = timestamp + self.frame_step;
                SampleBuffer::video(timestamp, planes)
            }
            SamplePayload::Audio(pcm) => {
                self.next_estimate = timestamp + pcm.frames() as f64 / pcm.sample_rate() as f64;
                SampleBuffer::audio(timestamp, pcm)
            }
        };

        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(sample).is_err() {
            log::debug!("Consumer of stream {} went away", self.stream_index);
            self.tx = None;
        }
    }
}

fn seconds(timestamp: Option<i64>, start: i64, time_base: f64) -> Option<f64> {
    let ts = timestamp?;
    let origin = if start == NO_PTS { 0 } else { start };
    Some(((ts - origin) as f64 * time_base).max(0.0))
}

fn convert_video(
    decoded: &ffmpeg_next::util::frame::video::Video,
    scaler: &mut Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
) -> Result<VideoPlanes, MediaError> {
    if scaler.is_none() {
        *scaler = Some(ffmpeg_next::software::scaling::Context::get(
            decoded.format(),
            decoded.width(),
            decoded.height(),
            ffmpeg_next::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )?);
    }
    let Some(scaler) = scaler.as_mut() else {
        return Err("scaler unavailable".into());
    };

    let mut yuv = ffmpeg_next::util::frame::video::Video::empty();
    scaler.run(decoded, &mut yuv)?;
    Ok(extract_yuv_planes(&yuv, width, height))
}

/// Copies the three planes of a YUV 4:2:0 frame into one packed buffer.
///
/// ffmpeg frames may pad each row (stride > width); the padding is dropped.
fn extract_yuv_planes(
    frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> VideoPlanes {
    let (cw, ch) = VideoPlanes::chroma_size(width, height);
    let mut data = Vec::with_capacity(VideoPlanes::packed_len(width, height));
    for (index, row_bytes, rows) in [
        (0, width as usize, height as usize),
        (1, cw as usize, ch as usize),
        (2, cw as usize, ch as usize),
    ] {
        let stride = frame.stride(index);
        let src = frame.data(index);
        for row in 0..rows {
            let start = row * stride;
            data.extend_from_slice(&src[start..start + row_bytes]);
        }
    }
    VideoPlanes::new(data, width, height)
}

fn convert_audio(
    decoded: &mut ffmpeg_next::util::frame::audio::Audio,
    resampler: &mut Option<ffmpeg_next::software::resampling::Context>,
    sample_rate: u32,
    channels: u16,
) -> Result<PcmSamples, MediaError> {
    if decoded.channel_layout().is_empty() {
        decoded.set_channel_layout(ffmpeg_next::ChannelLayout::default(
            i32::from(decoded.channels()),
        ));
    }
    if resampler.is_none() {
        *resampler = Some(ffmpeg_next::software::resampling::Context::get(
            decoded.format(),
            decoded.channel_layout(),
            decoded.rate(),
            ffmpeg_next::format::Sample::F32(ffmpeg_next::format::sample::Type::Packed),
            ffmpeg_next::ChannelLayout::default(i32::from(channels)),
            sample_rate,
        )?);
    }
    let Some(resampler) = resampler.as_mut() else {
        return Err("resampler unavailable".into());
    };

    let mut out = ffmpeg_next::util::frame::audio::Audio::empty();
    resampler.run(decoded, &mut out)?;
    Ok(PcmSamples::new(packed_f32(&out, channels), sample_rate, channels))
}

/// Reads interleaved f32 samples out of a packed frame.
fn packed_f32(frame: &ffmpeg_next::util::frame::audio::Audio, channels: u16) -> Vec<f32> {
    let count = frame.samples() * channels as usize;
    if count == 0 {
        return Vec::new();
    }
    frame.data(0)[..count * 4]
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
