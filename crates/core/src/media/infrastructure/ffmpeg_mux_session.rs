use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::media::domain::demux_session::MediaError;
use crate::media::domain::mux_session::{
    AudioEncodeSettings, EncodeSettings, MuxOptions, MuxSession, MuxStatus, TrackInput,
    VideoEncodeSettings,
};
use crate::shared::aspect_fill::AspectFill;
use crate::shared::constants::{TRACK_QUEUE_CAPACITY, VIDEO_TIME_BASE};
use crate::shared::sample_buffer::{SampleBuffer, SamplePayload, VideoPlanes};
use crate::shared::track_info::MediaKind;

/// Encoders and muxer, handed to the writer thread on `start_writing`.
struct MuxState {
    octx: ffmpeg_next::format::context::Output,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
}

// Safety: MuxState is built on the caller's thread and then moved, whole,
// into the writer thread; it is never shared between threads.
unsafe impl Send for MuxState {}

struct VideoTrack {
    encoder: ffmpeg_next::codec::encoder::video::Encoder,
    rx: Receiver<SampleBuffer>,
    stream_index: usize,
    width: u32,
    height: u32,
    enc_time_base: ffmpeg_next::Rational,
    ost_time_base: ffmpeg_next::Rational,
    scaler: Option<(u32, u32, ffmpeg_next::software::scaling::Context)>,
    last_pts: Option<i64>,
}

struct AudioTrack {
    encoder: ffmpeg_next::codec::encoder::audio::Encoder,
    rx: Receiver<SampleBuffer>,
    stream_index: usize,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    enc_time_base: ffmpeg_next::Rational,
    ost_time_base: ffmpeg_next::Rational,
    pending: Vec<f32>,
    next_pts: Option<i64>,
}

/// Why the writer thread stopped without error.
enum WriteEnd {
    Finalized,
    Cancelled,
}

/// Encodes H.264/AAC with ffmpeg-next and muxes into an MP4 file.
///
/// Encoding happens on a writer thread that selects over the per-track
/// input queues; a full queue is what "not ready for more data" means.
pub struct FfmpegMuxSession {
    path: PathBuf,
    options: MuxOptions,
    state: Option<MuxState>,
    status: Arc<Mutex<MuxStatus>>,
    cancel_tx: Option<Sender<()>>,
    writer: Option<JoinHandle<Result<WriteEnd, MediaError>>>,
}

impl FfmpegMuxSession {
    pub fn create(path: &Path, options: &MuxOptions) -> Result<Self, MediaError> {
        ffmpeg_next::init()?;

        let octx = ffmpeg_next::format::output_as(&path, "mp4")?;
        Ok(Self {
            path: path.to_path_buf(),
            options: options.clone(),
            state: Some(MuxState {
                octx,
                video: None,
                audio: None,
            }),
            status: Arc::new(Mutex::new(MuxStatus::NotStarted)),
            cancel_tx: None,
            writer: None,
        })
    }

    fn set_status(&self, status: MuxStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

impl MuxSession for FfmpegMuxSession {
    fn add_input(&mut self, settings: &EncodeSettings) -> Result<Box<dyn TrackInput>, MediaError> {
        if self.status() != MuxStatus::NotStarted {
            return Err("inputs must be added before writing starts".into());
        }
        let state = self.state.as_mut().ok_or("FfmpegMuxSession: not created")?;
        let (tx, rx) = crossbeam_channel::bounded(TRACK_QUEUE_CAPACITY);

        match settings {
            EncodeSettings::H264(video) => {
                if state.video.is_some() {
                    return Err("video input already added".into());
                }
                state.video = Some(add_video_stream(&mut state.octx, video, rx)?);
            }
            EncodeSettings::Aac(audio) => {
                if state.audio.is_some() {
                    return Err("audio input already added".into());
                }
                state.audio = Some(add_audio_stream(&mut state.octx, audio, rx)?);
            }
        }

        Ok(Box::new(ChannelTrackInput {
            kind: settings.kind(),
            tx: Some(tx),
        }))
    }

    fn start_writing(&mut self, origin: f64) -> Result<(), MediaError> {
        if self.status() != MuxStatus::NotStarted {
            return Err("writing already started".into());
        }
        let mut state = self.state.take().ok_or("FfmpegMuxSession: not created")?;
        if state.video.is_none() && state.audio.is_none() {
            return Err("no inputs added".into());
        }

        let mut header_opts = ffmpeg_next::Dictionary::new();
        if self.options.network_optimized {
            header_opts.set("movflags", "faststart");
        }
        state.octx.write_header_with(header_opts)?;

        // The muxer may pick its own stream time bases while writing the header.
        if let Some(video) = state.video.as_mut() {
            video.ost_time_base = stream_time_base(&state.octx, video.stream_index)?;
        }
        if let Some(audio) = state.audio.as_mut() {
            audio.ost_time_base = stream_time_base(&state.octx, audio.stream_index)?;
        }

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        let status = self.status.clone();
        let handle = std::thread::Builder::new()
            .name("mux".to_string())
            .spawn(move || {
                let result = run_writer(state, origin, &cancel_rx);
                if let Err(e) = &result {
                    *status.lock().unwrap_or_else(|p| p.into_inner()) =
                        MuxStatus::Failed(e.to_string());
                }
                result
            })?;

        self.cancel_tx = Some(cancel_tx);
        self.writer = Some(handle);
        self.set_status(MuxStatus::Writing);
        log::debug!("Writing {}", self.path.display());
        Ok(())
    }

    fn status(&self) -> MuxStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn finish_writing(&mut self) -> Result<(), MediaError> {
        let handle = self.writer.take().ok_or("writing has not started")?;
        let outcome = handle.join().map_err(|_| "mux writer thread panicked")?;
        self.cancel_tx = None;

        match outcome {
            Ok(WriteEnd::Finalized) => {
                self.set_status(MuxStatus::Finished);
                log::debug!("Finalized {}", self.path.display());
                Ok(())
            }
            Ok(WriteEnd::Cancelled) => {
                self.set_status(MuxStatus::Cancelled);
                Err("writing was cancelled".into())
            }
            Err(e) => {
                self.set_status(MuxStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn cancel_writing(&mut self) {
        // Disconnecting the cancel channel wakes the writer's select.
        self.cancel_tx = None;
        self.state = None;
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if !matches!(self.status(), MuxStatus::Finished | MuxStatus::Failed(_)) {
            self.set_status(MuxStatus::Cancelled);
        }
    }
}

impl Drop for FfmpegMuxSession {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.cancel_writing();
        }
    }
}

struct ChannelTrackInput {
    kind: MediaKind,
    tx: Option<Sender<SampleBuffer>>,
}

impl TrackInput for ChannelTrackInput {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_ready_for_more(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_full())
    }

    fn append(&mut self, sample: SampleBuffer) -> Result<(), MediaError> {
        if sample.kind() != self.kind {
            return Err(format!("{} sample sent to {} input", sample.kind(), self.kind).into());
        }
        let tx = self.tx.as_ref().ok_or("input already marked finished")?;
        tx.send(sample)
            .map_err(|_| "mux session stopped accepting samples".into())
    }

    fn mark_finished(&mut self) {
        self.tx = None;
    }
}

fn stream_time_base(
    octx: &ffmpeg_next::format::context::Output,
    index: usize,
) -> Result<ffmpeg_next::Rational, MediaError> {
    octx.stream(index)
        .map(|s| s.time_base())
        .ok_or_else(|| format!("output stream {index} missing").into())
}

/// Display matrix for a clockwise rotation in quarter turns.
pub(crate) fn display_matrix(rotation: i32) -> [i32; 9] {
    const ONE: i32 = 1 << 16;
    let (cos, sin) = match rotation.rem_euclid(360) {
        90 => (0, ONE),
        180 => (-ONE, 0),
        270 => (0, -ONE),
        _ => (ONE, 0),
    };
    [cos, sin, 0, -sin, cos, 0, 0, 0, 1 << 30]
}

/// Tags `stream` with a clockwise `rotation`.
///
/// Newer mov muxers only read the display matrix side data; the `"rotate"`
/// tag is kept for older readers. Must run after `set_parameters`, which
/// replaces the stream's side data.
pub(crate) fn set_rotation(
    stream: &mut ffmpeg_next::format::stream::StreamMut,
    rotation: i32,
) -> Result<(), MediaError> {
    let bytes: Vec<u8> = display_matrix(rotation)
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    // Safety: the stream belongs to an output context that has not written
    // its header; the returned buffer is exactly `bytes.len()` long.
    #[allow(deprecated)]
    unsafe {
        let data = ffmpeg_next::ffi::av_stream_new_side_data(
            stream.as_mut_ptr(),
            ffmpeg_next::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
            bytes.len() as _,
        );
        if data.is_null() {
            return Err("could not allocate display matrix".into());
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
    }

    let mut metadata = ffmpeg_next::Dictionary::new();
    metadata.set("rotate", &rotation.rem_euclid(360).to_string());
    stream.set_metadata(metadata);
    Ok(())
}

fn has_global_header(octx: &ffmpeg_next::format::context::Output) -> bool {
    octx.format()
        .flags()
        .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER)
}

/// H.264 with 4:2:0 chroma needs even dimensions.
fn even(value: u32) -> u32 {
    (value & !1).max(2)
}

fn add_video_stream(
    octx: &mut ffmpeg_next::format::context::Output,
    settings: &VideoEncodeSettings,
    rx: Receiver<SampleBuffer>,
) -> Result<VideoTrack, MediaError> {
    let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264)
        .ok_or("H.264 encoder not found")?;
    let global_header = has_global_header(octx);
    let width = even(settings.width);
    let height = even(settings.height);

    let mut ost = octx.add_stream(Some(codec))?;
    let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()?;
    encoder_ctx.set_width(width);
    encoder_ctx.set_height(height);
    encoder_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
    encoder_ctx.set_time_base(ffmpeg_next::Rational(1, VIDEO_TIME_BASE));
    if settings.frame_rate > 0.0 {
        encoder_ctx.set_frame_rate(Some(ffmpeg_next::Rational::from(settings.frame_rate)));
    }
    encoder_ctx.set_bit_rate(settings.bitrate as usize);
    if global_header {
        encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }

    let encoder = encoder_ctx.open_as(codec)?;
    ost.set_parameters(&encoder);
    ost.set_time_base(ffmpeg_next::Rational(1, VIDEO_TIME_BASE));
    if settings.rotation != 0 {
        set_rotation(&mut ost, settings.rotation)?;
    }
    let stream_index = ost.index();
    let enc_time_base = ffmpeg_next::Rational(1, VIDEO_TIME_BASE);

    Ok(VideoTrack {
        encoder,
        rx,
        stream_index,
        width,
        height,
        enc_time_base,
        ost_time_base: enc_time_base,
        scaler: None,
        last_pts: None,
    })
}

fn add_audio_stream(
    octx: &mut ffmpeg_next::format::context::Output,
    settings: &AudioEncodeSettings,
    rx: Receiver<SampleBuffer>,
) -> Result<AudioTrack, MediaError> {
    let codec =
        ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).ok_or("AAC encoder not found")?;
    let global_header = has_global_header(octx);

    let mut ost = octx.add_stream(Some(codec))?;
    let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
        .encoder()
        .audio()?;
    encoder_ctx.set_rate(settings.sample_rate as i32);
    encoder_ctx.set_channel_layout(ffmpeg_next::ChannelLayout::default(i32::from(
        settings.channels,
    )));
    encoder_ctx.set_format(ffmpeg_next::format::Sample::F32(
        ffmpeg_next::format::sample::Type::Planar,
    ));
    encoder_ctx.set_bit_rate(settings.bitrate as usize);
    encoder_ctx.set_time_base(ffmpeg_next::Rational(1, settings.sample_rate as i32));
    if global_header {
        encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }

    let encoder = encoder_ctx.open_as(codec)?;
    ost.set_parameters(&encoder);
    let stream_index = ost.index();
    let enc_time_base = ffmpeg_next::Rational(1, settings.sample_rate as i32);
    let frame_size = match encoder.frame_size() {
        0 => 1024,
        n => n as usize,
    };

    Ok(AudioTrack {
        encoder,
        rx,
        stream_index,
        sample_rate: settings.sample_rate,
        channels: settings.channels,
        frame_size,
        enc_time_base,
        ost_time_base: enc_time_base,
        pending: Vec::new(),
        next_pts: None,
    })
}

fn run_writer(
    mut state: MuxState,
    origin: f64,
    cancel_rx: &Receiver<()>,
) -> Result<WriteEnd, MediaError> {
    let never = crossbeam_channel::never::<SampleBuffer>();
    let video_rx = state.video.as_ref().map_or_else(|| never.clone(), |v| v.rx.clone());
    let audio_rx = state.audio.as_ref().map_or_else(|| never.clone(), |a| a.rx.clone());
    let mut video_done = state.video.is_none();
    let mut audio_done = state.audio.is_none();

    while !(video_done && audio_done) {
        let v = if video_done { &never } else { &video_rx };
        let a = if audio_done { &never } else { &audio_rx };

        crossbeam_channel::select! {
            recv(v) -> msg => match msg {
                Ok(sample) => write_video(&mut state, sample, origin)?,
                Err(_) => {
                    video_done = true;
                    finish_video(&mut state)?;
                }
            },
            recv(a) -> msg => match msg {
                Ok(sample) => write_audio(&mut state, sample, origin)?,
                Err(_) => {
                    audio_done = true;
                    finish_audio(&mut state)?;
                }
            },
            recv(cancel_rx) -> _ => return Ok(WriteEnd::Cancelled),
        }
    }

    state.octx.write_trailer()?;
    Ok(WriteEnd::Finalized)
}

fn write_video(state: &mut MuxState, sample: SampleBuffer, origin: f64) -> Result<(), MediaError> {
    let video = state.video.as_mut().ok_or("no video stream")?;
    let timestamp = sample.timestamp() - origin;
    let SamplePayload::Video(planes) = sample.into_payload() else {
        return Err("audio sample on video stream".into());
    };

    let mut frame = video.picture(&planes)?;
    let mut pts = (timestamp.max(0.0) * f64::from(VIDEO_TIME_BASE)).round() as i64;
    if let Some(last) = video.last_pts {
        if pts <= last {
            pts = last + 1;
        }
    }
    video.last_pts = Some(pts);
    frame.set_pts(Some(pts));

    video.encoder.send_frame(&frame)?;
    write_encoded(
        &mut video.encoder,
        &mut state.octx,
        video.stream_index,
        video.enc_time_base,
        video.ost_time_base,
    )
}

fn finish_video(state: &mut MuxState) -> Result<(), MediaError> {
    let Some(video) = state.video.as_mut() else {
        return Ok(());
    };
    video.encoder.send_eof()?;
    write_encoded(
        &mut video.encoder,
        &mut state.octx,
        video.stream_index,
        video.enc_time_base,
        video.ost_time_base,
    )
}

fn write_audio(state: &mut MuxState, sample: SampleBuffer, origin: f64) -> Result<(), MediaError> {
    let audio = state.audio.as_mut().ok_or("no audio stream")?;
    let timestamp = sample.timestamp() - origin;
    let SamplePayload::Audio(pcm) = sample.into_payload() else {
        return Err("video sample on audio stream".into());
    };
    if pcm.channels() != audio.channels || pcm.sample_rate() != audio.sample_rate {
        return Err(format!(
            "audio input expects {} Hz / {} ch, got {} Hz / {} ch",
            audio.sample_rate,
            audio.channels,
            pcm.sample_rate(),
            pcm.channels()
        )
        .into());
    }

    // Audio that starts late keeps its offset from the timeline origin.
    if audio.next_pts.is_none() {
        audio.next_pts = Some((timestamp.max(0.0) * f64::from(audio.sample_rate)).round() as i64);
    }
    audio.pending.extend_from_slice(pcm.samples());

    let chunk_len = audio.frame_size * audio.channels as usize;
    while audio.pending.len() >= chunk_len {
        let chunk: Vec<f32> = audio.pending.drain(..chunk_len).collect();
        audio.encode_chunk(&chunk, &mut state.octx)?;
    }
    Ok(())
}

fn finish_audio(state: &mut MuxState) -> Result<(), MediaError> {
    let Some(audio) = state.audio.as_mut() else {
        return Ok(());
    };
    if !audio.pending.is_empty() {
        let rest = std::mem::take(&mut audio.pending);
        audio.encode_chunk(&rest, &mut state.octx)?;
    }
    audio.encoder.send_eof()?;
    write_encoded(
        &mut audio.encoder,
        &mut state.octx,
        audio.stream_index,
        audio.enc_time_base,
        audio.ost_time_base,
    )
}

fn write_encoded(
    encoder: &mut ffmpeg_next::codec::encoder::Encoder,
    octx: &mut ffmpeg_next::format::context::Output,
    stream_index: usize,
    enc_time_base: ffmpeg_next::Rational,
    ost_time_base: ffmpeg_next::Rational,
) -> Result<(), MediaError> {
    let mut encoded = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        encoded.rescale_ts(enc_time_base, ost_time_base);
        encoded.write_interleaved(octx)?;
    }
    Ok(())
}

impl VideoTrack {
    /// Converts packed planes into an encoder-sized frame, applying
    /// aspect-fill scaling when the sample size differs from the target.
    fn picture(
        &mut self,
        planes: &VideoPlanes,
    ) -> Result<ffmpeg_next::util::frame::video::Video, MediaError> {
        if planes.width() == 0 || planes.height() == 0 {
            return Err("empty video sample".into());
        }
        let source = planes_to_frame(planes);
        if (planes.width(), planes.height()) == (self.width, self.height) {
            return Ok(source);
        }

        let fill = AspectFill::compute(planes.width(), planes.height(), self.width, self.height);
        let stale = !matches!(
            &self.scaler,
            Some((w, h, _)) if (*w, *h) == (planes.width(), planes.height())
        );
        if stale {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                ffmpeg_next::format::Pixel::YUV420P,
                planes.width(),
                planes.height(),
                ffmpeg_next::format::Pixel::YUV420P,
                fill.scaled_width,
                fill.scaled_height,
                ffmpeg_next::software::scaling::Flags::BICUBIC,
            )?;
            self.scaler = Some((planes.width(), planes.height(), scaler));
        }
        let Some((_, _, scaler)) = self.scaler.as_mut() else {
            return Err("scaler unavailable".into());
        };

        let mut scaled = ffmpeg_next::util::frame::video::Video::empty();
        scaler.run(&source, &mut scaled)?;
        Ok(crop_frame(&scaled, &fill, self.width, self.height))
    }
}

impl AudioTrack {
    /// Encodes interleaved samples as one planar frame.
    fn encode_chunk(
        &mut self,
        chunk: &[f32],
        octx: &mut ffmpeg_next::format::context::Output,
    ) -> Result<(), MediaError> {
        let Some(mut frame) = planar_frame(chunk, self.channels, self.sample_rate) else {
            return Ok(());
        };
        let pts = self.next_pts.unwrap_or(0);
        frame.set_pts(Some(pts));

        self.encoder.send_frame(&frame)?;
        self.next_pts = Some(pts + frame.samples() as i64);
        write_encoded(
            &mut self.encoder,
            octx,
            self.stream_index,
            self.enc_time_base,
            self.ost_time_base,
        )
    }
}

/// Splits interleaved `chunk` into a planar F32 frame; `None` when empty.
///
/// Planes are addressed through `plane_mut`, which is sized by the sample
/// count. Only the first plane carries a linesize for audio frames.
fn planar_frame(
    chunk: &[f32],
    channels: u16,
    sample_rate: u32,
) -> Option<ffmpeg_next::util::frame::audio::Audio> {
    let channel_count = usize::from(channels.max(1));
    let frames = chunk.len() / channel_count;
    if frames == 0 {
        return None;
    }

    let mut frame = ffmpeg_next::util::frame::audio::Audio::new(
        ffmpeg_next::format::Sample::F32(ffmpeg_next::format::sample::Type::Planar),
        frames,
        ffmpeg_next::ChannelLayout::default(i32::from(channels)),
    );
    frame.set_rate(sample_rate);
    for c in 0..channel_count {
        let plane = frame.plane_mut::<f32>(c);
        for (i, slot) in plane.iter_mut().enumerate().take(frames) {
            *slot = chunk[i * channel_count + c];
        }
    }
    Some(frame)
}

fn planes_to_frame(planes: &VideoPlanes) -> ffmpeg_next::util::frame::video::Video {
    let mut frame = ffmpeg_next::util::frame::video::Video::new(
        ffmpeg_next::format::Pixel::YUV420P,
        planes.width(),
        planes.height(),
    );
    for index in 0..3 {
        let (src, row_bytes) = planes.plane(index);
        let stride = frame.stride(index);
        let dst = frame.data_mut(index);
        for (row, line) in src.chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            dst[start..start + row_bytes].copy_from_slice(line);
        }
    }
    frame
}

/// Copies the centred `width` x `height` window out of an aspect-filled frame.
fn crop_frame(
    scaled: &ffmpeg_next::util::frame::video::Video,
    fill: &AspectFill,
    width: u32,
    height: u32,
) -> ffmpeg_next::util::frame::video::Video {
    let mut out = ffmpeg_next::util::frame::video::Video::new(
        ffmpeg_next::format::Pixel::YUV420P,
        width,
        height,
    );
    let (cw, ch) = VideoPlanes::chroma_size(width, height);
    for (index, row_bytes, rows, x, y) in [
        (0, width as usize, height as usize, fill.crop_x, fill.crop_y),
        (1, cw as usize, ch as usize, fill.crop_x / 2, fill.crop_y / 2),
        (2, cw as usize, ch as usize, fill.crop_x / 2, fill.crop_y / 2),
    ] {
        let src_stride = scaled.stride(index);
        let dst_stride = out.stride(index);
        let src = scaled.data(index);
        let dst = out.data_mut(index);
        for row in 0..rows {
            let s = (row + y as usize) * src_stride + x as usize;
            let d = row * dst_stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
    out
}
