//! In-memory media backend for exercising the orchestrator without ffmpeg.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::media::domain::demux_session::{
    DemuxSession, DemuxStatus, DemuxStatusHandle, MediaError, OutputSettings, TrackOutput,
};
use crate::media::domain::media_backend::MediaBackend;
use crate::media::domain::mux_session::{
    EncodeSettings, MuxOptions, MuxSession, MuxStatus, TrackInput,
};
use crate::shared::sample_buffer::{PcmSamples, SampleBuffer, VideoPlanes};
use crate::shared::track_info::{AssetInfo, MediaKind, TrackInfo};

#[derive(Clone, Default)]
pub struct StubConfig {
    pub info: AssetInfo,
    pub video_timestamps: Vec<f64>,
    pub audio_timestamps: Vec<f64>,
    pub fail_open: bool,
    pub fail_create_mux: bool,
    pub fail_add_output: Option<MediaKind>,
    pub fail_add_input: Option<MediaKind>,
    /// Fails the demux session after this many video samples.
    pub fail_source_after: Option<usize>,
    /// Fails appends on this kind after this many samples.
    pub fail_append: Option<(MediaKind, usize)>,
    pub fail_finish: bool,
    /// Inputs report busy before every other sample.
    pub busy_inputs: bool,
}

impl StubConfig {
    /// An asset with one video and one audio track and `frames` samples each.
    pub fn audio_video(duration: f64, frames: usize) -> Self {
        let step = duration / frames as f64;
        let timestamps: Vec<f64> = (0..frames).map(|i| i as f64 * step).collect();
        Self {
            info: AssetInfo {
                duration_secs: duration,
                tracks: vec![
                    TrackInfo::video(0, 4, 4, 30.0).with_rotation(90),
                    TrackInfo::audio(1, 48_000, 1),
                ],
            },
            video_timestamps: timestamps.clone(),
            audio_timestamps: timestamps,
            ..Default::default()
        }
    }

    pub fn without(mut self, kind: MediaKind) -> Self {
        self.info.tracks.retain(|t| t.kind != kind);
        self
    }
}

/// What the stub mux sessions saw.
#[derive(Default)]
pub struct StubRecord {
    pub appended: Vec<(MediaKind, f64)>,
    pub encode_settings: Vec<EncodeSettings>,
    pub mux_options: Vec<MuxOptions>,
    pub outputs: Vec<PathBuf>,
    pub finished_inputs: Vec<MediaKind>,
    pub cancelled_demux: usize,
    pub cancelled_mux: usize,
}

pub struct StubBackend {
    config: StubConfig,
    opened: AtomicUsize,
    record: Arc<Mutex<StubRecord>>,
}

impl StubBackend {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            opened: AtomicUsize::new(0),
            record: Arc::new(Mutex::new(StubRecord::default())),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn record<R>(&self, f: impl FnOnce(&StubRecord) -> R) -> R {
        f(&self.record.lock().unwrap())
    }
}

impl MediaBackend for StubBackend {
    fn open_demux(&self, path: &Path) -> Result<Box<dyn DemuxSession>, MediaError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_open {
            return Err(format!("cannot open {}", path.display()).into());
        }
        if !path.exists() {
            return Err(format!("{} does not exist", path.display()).into());
        }
        Ok(Box::new(StubDemux {
            config: self.config.clone(),
            status: DemuxStatusHandle::new(),
            open_outputs: Arc::new(AtomicUsize::new(0)),
            record: self.record.clone(),
        }))
    }

    fn create_mux(
        &self,
        path: &Path,
        options: &MuxOptions,
    ) -> Result<Box<dyn MuxSession>, MediaError> {
        if self.config.fail_create_mux {
            return Err("no space left".into());
        }
        std::fs::write(path, b"")?;
        let mut record = self.record.lock().unwrap();
        record.outputs.push(path.to_path_buf());
        record.mux_options.push(options.clone());
        Ok(Box::new(StubMux {
            config: self.config.clone(),
            path: path.to_path_buf(),
            status: MuxStatus::NotStarted,
            record: self.record.clone(),
        }))
    }
}

struct StubDemux {
    config: StubConfig,
    status: DemuxStatusHandle,
    /// Outputs not yet exhausted; the session completes when this hits zero.
    open_outputs: Arc<AtomicUsize>,
    record: Arc<Mutex<StubRecord>>,
}

impl DemuxSession for StubDemux {
    fn asset_info(&self) -> &AssetInfo {
        &self.config.info
    }

    fn add_output(
        &mut self,
        track: &TrackInfo,
        settings: &OutputSettings,
    ) -> Result<Box<dyn TrackOutput>, MediaError> {
        if self.config.fail_add_output == Some(track.kind) {
            return Err("decoder unavailable".into());
        }
        let (timestamps, fail_after) = match track.kind {
            MediaKind::Video => (&self.config.video_timestamps, self.config.fail_source_after),
            MediaKind::Audio => (&self.config.audio_timestamps, None),
        };
        let samples = timestamps
            .iter()
            .map(|&ts| match settings {
                OutputSettings::Yuv420p => SampleBuffer::video(
                    ts,
                    VideoPlanes::new(vec![0; VideoPlanes::packed_len(4, 4)], 4, 4),
                ),
                OutputSettings::LinearPcm {
                    sample_rate,
                    channels,
                } => SampleBuffer::audio(
                    ts,
                    PcmSamples::new(vec![0.0; *channels as usize * 2], *sample_rate, *channels),
                ),
            })
            .collect();
        self.open_outputs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubTrackOutput {
            track: track.clone(),
            samples,
            delivered: 0,
            fail_after,
            exhausted: false,
            open_outputs: self.open_outputs.clone(),
            status: self.status.clone(),
        }))
    }

    fn start_reading(&mut self) -> Result<(), MediaError> {
        self.status.set(DemuxStatus::Reading);
        Ok(())
    }

    fn status(&self) -> DemuxStatusHandle {
        self.status.clone()
    }

    fn cancel_reading(&mut self) {
        self.status.finish(DemuxStatus::Cancelled);
        self.record.lock().unwrap().cancelled_demux += 1;
    }
}

struct StubTrackOutput {
    track: TrackInfo,
    samples: VecDeque<SampleBuffer>,
    delivered: usize,
    fail_after: Option<usize>,
    exhausted: bool,
    open_outputs: Arc<AtomicUsize>,
    status: DemuxStatusHandle,
}

impl TrackOutput for StubTrackOutput {
    fn track(&self) -> &TrackInfo {
        &self.track
    }

    fn next_sample(&mut self) -> Option<SampleBuffer> {
        if self.status.get() != DemuxStatus::Reading {
            return None;
        }
        if self.fail_after == Some(self.delivered) {
            self.status.finish(DemuxStatus::Failed("corrupt packet".into()));
            return None;
        }
        if let Some(sample) = self.samples.pop_front() {
            self.delivered += 1;
            return Some(sample);
        }

        // Like a real reader, the track only closes once the whole session ends.
        self.release();
        while !self.status.get().is_terminal() {
            std::thread::yield_now();
        }
        None
    }
}

impl StubTrackOutput {
    fn release(&mut self) {
        if !self.exhausted {
            self.exhausted = true;
            if self.open_outputs.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.status.finish(DemuxStatus::Completed);
            }
        }
    }
}

impl Drop for StubTrackOutput {
    fn drop(&mut self) {
        self.release();
    }
}

struct StubMux {
    config: StubConfig,
    path: PathBuf,
    status: MuxStatus,
    record: Arc<Mutex<StubRecord>>,
}

impl MuxSession for StubMux {
    fn add_input(&mut self, settings: &EncodeSettings) -> Result<Box<dyn TrackInput>, MediaError> {
        if self.config.fail_add_input == Some(settings.kind()) {
            return Err("encoder unavailable".into());
        }
        self.record
            .lock()
            .unwrap()
            .encode_settings
            .push(settings.clone());
        let fail_after = self
            .config
            .fail_append
            .filter(|(kind, _)| *kind == settings.kind())
            .map(|(_, n)| n);
        Ok(Box::new(StubTrackInput {
            kind: settings.kind(),
            appended: 0,
            fail_after,
            busy: self.config.busy_inputs,
            finished: false,
            record: self.record.clone(),
        }))
    }

    fn start_writing(&mut self, _origin: f64) -> Result<(), MediaError> {
        self.status = MuxStatus::Writing;
        Ok(())
    }

    fn status(&self) -> MuxStatus {
        self.status.clone()
    }

    fn finish_writing(&mut self) -> Result<(), MediaError> {
        if self.config.fail_finish {
            self.status = MuxStatus::Failed("disk full".into());
            return Err("disk full".into());
        }
        std::fs::write(&self.path, b"stub mp4")?;
        self.status = MuxStatus::Finished;
        Ok(())
    }

    fn cancel_writing(&mut self) {
        self.status = MuxStatus::Cancelled;
        self.record.lock().unwrap().cancelled_mux += 1;
    }
}

struct StubTrackInput {
    kind: MediaKind,
    appended: usize,
    fail_after: Option<usize>,
    busy: bool,
    finished: bool,
    record: Arc<Mutex<StubRecord>>,
}

impl TrackInput for StubTrackInput {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_ready_for_more(&self) -> bool {
        !self.finished && !(self.busy && self.appended % 2 == 1)
    }

    fn append(&mut self, sample: SampleBuffer) -> Result<(), MediaError> {
        if self.finished {
            return Err("input finished".into());
        }
        if self.fail_after == Some(self.appended) {
            return Err("encoder rejected sample".into());
        }
        self.appended += 1;
        self.record
            .lock()
            .unwrap()
            .appended
            .push((sample.kind(), sample.timestamp()));
        Ok(())
    }

    fn mark_finished(&mut self) {
        if !self.finished {
            self.finished = true;
            self.record.lock().unwrap().finished_inputs.push(self.kind);
        }
    }
}
