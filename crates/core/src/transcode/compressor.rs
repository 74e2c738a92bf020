use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::asset::domain::asset_materializer::AssetMaterializer;
use crate::asset::infrastructure::temp_file_materializer::TempFileMaterializer;
use crate::media::domain::demux_session::{DemuxSession, OutputSettings};
use crate::media::domain::media_backend::MediaBackend;
use crate::media::domain::mux_session::{
    AudioEncodeSettings, EncodeSettings, MuxOptions, MuxSession, ScalingMode,
    VideoEncodeSettings,
};
use crate::media::infrastructure::ffmpeg_backend::FfmpegBackend;
use crate::shared::constants::{
    AUDIO_BITRATE, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, FALLBACK_FRAME_RATE,
};
use crate::shared::progress::ProgressReporter;
use crate::shared::source_asset::SourceAsset;
use crate::shared::track_info::{MediaKind, TrackInfo};
use crate::transcode::compress_error::CompressError;
use crate::transcode::compress_options::CompressOptions;
use crate::transcode::output_locator::next_output_path;
use crate::transcode::track_copy_loop::{copy_track, CopyOutcome};

type CopyResult = Result<CopyOutcome, CompressError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompressStage {
    Materializing,
    Opening,
    Copying,
    Finalizing,
}

impl fmt::Display for CompressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressStage::Materializing => "materializing",
            CompressStage::Opening => "opening",
            CompressStage::Copying => "copying",
            CompressStage::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Re-encodes source assets to H.264/AAC MP4 files in `output_dir`.
///
/// Each call owns its own demux and mux sessions, so overlapping calls on
/// clones of one `Compressor` are independent.
#[derive(Clone)]
pub struct Compressor {
    backend: Arc<dyn MediaBackend>,
    materializer: Arc<dyn AssetMaterializer>,
    output_dir: PathBuf,
}

impl Compressor {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        materializer: Arc<dyn AssetMaterializer>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            materializer,
            output_dir: output_dir.into(),
        }
    }

    /// FFmpeg backend, materializing into the system temp directory.
    pub fn with_ffmpeg(output_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(FfmpegBackend),
            Arc::new(TempFileMaterializer::default()),
            output_dir,
        )
    }

    /// Compresses `asset` and waits for the outcome.
    pub fn compress(
        &self,
        asset: &SourceAsset,
        options: CompressOptions,
    ) -> Result<PathBuf, CompressError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = self.compress_with_callback(asset.clone(), options, move |result| {
            let _ = tx.send(result);
        });

        let result = rx
            .recv()
            .unwrap_or_else(|_| Err(CompressError::Interrupted("compress".to_string())));
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        result
    }

    /// Runs the compression on a background thread and calls `on_complete`
    /// exactly once with the outcome.
    ///
    /// Returns `None` if the worker thread could not be spawned; in that case
    /// `on_complete` has already been called with the error.
    pub fn compress_with_callback<F>(
        &self,
        asset: SourceAsset,
        options: CompressOptions,
        on_complete: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce(Result<PathBuf, CompressError>) + Send + 'static,
    {
        let compressor = self.clone();
        let callback = Arc::new(std::sync::Mutex::new(Some(on_complete)));
        let worker_callback = callback.clone();

        let spawned = std::thread::Builder::new()
            .name("compress".to_string())
            .spawn(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    compressor.run(&asset, &options)
                }))
                .unwrap_or_else(|_| Err(CompressError::Interrupted("compress".to_string())));

                let tag = options.identifier.as_deref().unwrap_or("-");
                match &result {
                    Ok(path) => log::info!("[{tag}] Compressed to {}", path.display()),
                    Err(e) => log::warn!("[{tag}] Compression failed: {e}"),
                }
                deliver(&worker_callback, result);
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Could not start compression worker: {e}");
                deliver(&callback, Err(CompressError::Io(e)));
                None
            }
        }
    }

    fn run(
        &self,
        asset: &SourceAsset,
        options: &CompressOptions,
    ) -> Result<PathBuf, CompressError> {
        let tag = options.identifier.as_deref().unwrap_or("-");

        enter_stage(tag, CompressStage::Materializing);
        let materialized = self
            .materializer
            .materialize(asset)
            .map_err(CompressError::AssetDataUnavailable)?;
        check_cancelled(options)?;

        enter_stage(tag, CompressStage::Opening);
        let mut demux = self
            .backend
            .open_demux(materialized.path())
            .map_err(CompressError::ReaderCreationFailed)?;
        let info = demux.asset_info().clone();

        let video_track = info
            .first_track(MediaKind::Video)
            .cloned()
            .ok_or(CompressError::NoVideoTrack)?;
        let video_output = demux
            .add_output(&video_track, &OutputSettings::Yuv420p)
            .map_err(CompressError::VideoOutputAttachFailed)?;

        let audio_track = info
            .first_track(MediaKind::Audio)
            .cloned()
            .ok_or(CompressError::AudioTrackMissing)?;
        let audio_output = demux
            .add_output(
                &audio_track,
                &OutputSettings::LinearPcm {
                    sample_rate: AUDIO_SAMPLE_RATE,
                    channels: AUDIO_CHANNELS,
                },
            )
            .map_err(CompressError::AudioOutputAttachFailed)?;
        check_cancelled(options)?;

        let output_path = next_output_path(&self.output_dir);
        // Declared before the mux session so the file is closed before removal.
        let mut partial = PartialOutput::new(&output_path);
        let mut mux = self
            .backend
            .create_mux(&output_path, &MuxOptions::default())
            .map_err(CompressError::WriterCreationFailed)?;

        let video_input = mux
            .add_input(&video_encode_settings(&video_track, options.bitrate))
            .map_err(|source| CompressError::InputAttachFailed {
                kind: MediaKind::Video,
                source,
            })?;
        let audio_input = mux
            .add_input(&audio_encode_settings())
            .map_err(|source| CompressError::InputAttachFailed {
                kind: MediaKind::Audio,
                source,
            })?;
        check_cancelled(options)?;

        mux.start_writing(0.0)
            .map_err(CompressError::WriterCreationFailed)?;
        if let Err(e) = demux.start_reading() {
            mux.cancel_writing();
            return Err(CompressError::ReaderCreationFailed(e));
        }

        enter_stage(tag, CompressStage::Copying);
        let status = demux.status();
        let progress = options.progress.clone().map(|sink| {
            ProgressReporter::new(sink, options.identifier.clone(), info.duration_secs)
        });
        let cancelled = &*options.cancelled;
        let status = &status;

        let (video_result, audio_result) = std::thread::scope(|scope| {
            let video = std::thread::Builder::new()
                .name("video-copy".to_string())
                .spawn_scoped(scope, move || {
                    copy_track(video_output, video_input, status, cancelled, progress)
                });
            let audio = std::thread::Builder::new()
                .name("audio-copy".to_string())
                .spawn_scoped(scope, move || {
                    copy_track(audio_output, audio_input, status, cancelled, None)
                });
            (join_copy(video, "video-copy"), join_copy(audio, "audio-copy"))
        });

        enter_stage(tag, CompressStage::Finalizing);
        if let Some(error) = first_error(video_result, audio_result, tag) {
            abort(demux.as_mut(), mux.as_mut());
            return Err(error);
        }

        mux.finish_writing().map_err(CompressError::WriterFailed)?;
        std::fs::File::open(&output_path)?;

        partial.keep();
        Ok(output_path)
    }
}

fn deliver<F>(slot: &std::sync::Mutex<Option<F>>, result: Result<PathBuf, CompressError>)
where
    F: FnOnce(Result<PathBuf, CompressError>),
{
    let callback = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(callback) = callback {
        callback(result);
    }
}

fn enter_stage(tag: &str, stage: CompressStage) {
    log::debug!("[{tag}] {stage}");
}

fn check_cancelled(options: &CompressOptions) -> Result<(), CompressError> {
    if options.cancelled.load(Ordering::Relaxed) {
        return Err(CompressError::Cancelled);
    }
    Ok(())
}

fn video_encode_settings(track: &TrackInfo, bitrate: u64) -> EncodeSettings {
    let frame_rate = if track.frame_rate > 0.0 {
        track.frame_rate
    } else {
        FALLBACK_FRAME_RATE
    };
    EncodeSettings::H264(VideoEncodeSettings {
        bitrate,
        width: track.width,
        height: track.height,
        frame_rate,
        rotation: track.rotation,
        scaling: ScalingMode::AspectFill,
    })
}

fn audio_encode_settings() -> EncodeSettings {
    EncodeSettings::Aac(AudioEncodeSettings {
        bitrate: AUDIO_BITRATE,
        sample_rate: AUDIO_SAMPLE_RATE,
        channels: AUDIO_CHANNELS,
    })
}

fn join_copy(
    handle: std::io::Result<std::thread::ScopedJoinHandle<'_, CopyResult>>,
    name: &str,
) -> CopyResult {
    match handle {
        Ok(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(CompressError::Interrupted(name.to_string()))),
        Err(e) => {
            log::warn!("Could not spawn {name}: {e}");
            Err(CompressError::Interrupted(name.to_string()))
        }
    }
}

/// Coalesces both copy results into the first error, video first.
fn first_error(video: CopyResult, audio: CopyResult, tag: &str) -> Option<CompressError> {
    fn set_if_none(slot: &mut Option<CompressError>, err: CompressError) {
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    let mut first = None;
    for (kind, result) in [(MediaKind::Video, video), (MediaKind::Audio, audio)] {
        match result {
            Ok(outcome) => log::debug!(
                "[{tag}] {kind}: {} samples, last at {:.3}s",
                outcome.samples,
                outcome.last_timestamp.unwrap_or(0.0)
            ),
            Err(e) => set_if_none(&mut first, e),
        }
    }
    first
}

fn abort(demux: &mut dyn DemuxSession, mux: &mut dyn MuxSession) {
    demux.cancel_reading();
    mux.cancel_writing();
}

/// Removes the output file on drop unless `keep` was called.
struct PartialOutput {
    path: PathBuf,
    keep: bool,
}

impl PartialOutput {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            keep: false,
        }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed partial output {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {e}", self.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::stub_backend::{StubBackend, StubConfig};
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Arc<StubBackend>,
        compressor: Compressor,
        source: SourceAsset,
    }

    impl Fixture {
        fn new(config: StubConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for sub in ["tmp", "out"] {
                std::fs::create_dir(dir.path().join(sub)).unwrap();
            }
            let source_path = dir.path().join("source.mov");
            std::fs::write(&source_path, b"not really a movie").unwrap();

            let backend = Arc::new(StubBackend::new(config));
            let compressor = Compressor::new(
                backend.clone(),
                Arc::new(TempFileMaterializer::new(dir.path().join("tmp"))),
                dir.path().join("out"),
            );
            Self {
                dir,
                backend,
                compressor,
                source: SourceAsset::File(source_path),
            }
        }

        fn count(&self, sub: &str) -> usize {
            std::fs::read_dir(self.dir.path().join(sub)).unwrap().count()
        }
    }

    type Seen = Arc<Mutex<Vec<(f64, Option<String>)>>>;

    fn recording_options(identifier: &str) -> (CompressOptions, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CompressOptions::default()
            .with_identifier(identifier)
            .with_bitrate(2_000_000)
            .with_progress(Arc::new(move |fraction: f64, id: Option<&str>| {
                sink.lock().unwrap().push((fraction, id.map(str::to_string)));
            }));
        (options, seen)
    }

    #[test]
    fn test_compress_success() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 5));
        let (options, seen) = recording_options("clip-1");

        let path = fx.compressor.compress(&fx.source, options).unwrap();

        assert!(path.starts_with(fx.dir.path().join("out")));
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("compressed-") && n.ends_with(".mp4")));
        assert_eq!(std::fs::read(&path).unwrap(), b"stub mp4");
        assert_eq!(fx.count("tmp"), 0, "materialized copy must be removed");

        fx.backend.record(|r| {
            let videos = r.appended.iter().filter(|a| a.0 == MediaKind::Video).count();
            let audios = r.appended.iter().filter(|a| a.0 == MediaKind::Audio).count();
            assert_eq!((videos, audios), (5, 5));
            assert_eq!(r.finished_inputs.len(), 2);
            assert!(r.mux_options.iter().all(|o| o.network_optimized));
            assert_eq!(
                r.encode_settings,
                vec![
                    EncodeSettings::H264(VideoEncodeSettings {
                        bitrate: 2_000_000,
                        width: 4,
                        height: 4,
                        frame_rate: 30.0,
                        rotation: 90,
                        scaling: ScalingMode::AspectFill,
                    }),
                    EncodeSettings::Aac(AudioEncodeSettings {
                        bitrate: 128_000,
                        sample_rate: 44_100,
                        channels: 2,
                    }),
                ]
            );
        });

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(_, id)| id.as_deref() == Some("clip-1")));
        let fractions: Vec<f64> = seen.iter().map(|s| s.0).collect();
        assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(*fractions.last().unwrap(), 1.0);
    }

    #[test]
    fn test_callback_fires_exactly_once() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = fx
            .compressor
            .compress_with_callback(fx.source.clone(), CompressOptions::default(), move |r| {
                assert!(r.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_fires_once_on_failure() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3).without(MediaKind::Video));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();

        fx.compressor
            .compress_with_callback(fx.source.clone(), CompressOptions::default(), move |r| {
                sink.lock().unwrap().push(r.is_err());
            })
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_missing_video_track() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3).without(MediaKind::Video));
        let err = fx
            .compressor
            .compress(&fx.source, CompressOptions::default())
            .unwrap_err();
        assert!(matches!(err, CompressError::NoVideoTrack));
        assert_eq!(fx.count("out"), 0);
        assert_eq!(fx.count("tmp"), 0);
    }

    #[test]
    fn test_missing_audio_track() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3).without(MediaKind::Audio));
        let err = fx
            .compressor
            .compress(&fx.source, CompressOptions::default())
            .unwrap_err();
        assert!(matches!(err, CompressError::AudioTrackMissing));
        assert_eq!(fx.count("out"), 0);
    }

    #[rstest]
    #[case::unresolvable(SourceAsset::Unresolvable("ph://42".into()))]
    #[case::missing_file(SourceAsset::File("/nonexistent/clip.mov".into()))]
    fn test_unavailable_asset_skips_session_setup(#[case] asset: SourceAsset) {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3));
        let err = fx
            .compressor
            .compress(&asset, CompressOptions::default())
            .unwrap_err();
        assert!(matches!(err, CompressError::AssetDataUnavailable(_)));
        assert_eq!(fx.backend.opened(), 0);
        assert_eq!(fx.count("out"), 0);
    }

    #[rstest]
    #[case::open(
        |c: &mut StubConfig| c.fail_open = true,
        |e: &CompressError| matches!(e, CompressError::ReaderCreationFailed(_))
    )]
    #[case::video_output(
        |c: &mut StubConfig| c.fail_add_output = Some(MediaKind::Video),
        |e: &CompressError| matches!(e, CompressError::VideoOutputAttachFailed(_))
    )]
    #[case::audio_output(
        |c: &mut StubConfig| c.fail_add_output = Some(MediaKind::Audio),
        |e: &CompressError| matches!(e, CompressError::AudioOutputAttachFailed(_))
    )]
    #[case::create_mux(
        |c: &mut StubConfig| c.fail_create_mux = true,
        |e: &CompressError| matches!(e, CompressError::WriterCreationFailed(_))
    )]
    #[case::video_input(
        |c: &mut StubConfig| c.fail_add_input = Some(MediaKind::Video),
        |e: &CompressError| matches!(
            e,
            CompressError::InputAttachFailed { kind: MediaKind::Video, .. }
        )
    )]
    #[case::audio_input(
        |c: &mut StubConfig| c.fail_add_input = Some(MediaKind::Audio),
        |e: &CompressError| matches!(
            e,
            CompressError::InputAttachFailed { kind: MediaKind::Audio, .. }
        )
    )]
    #[case::finish(
        |c: &mut StubConfig| c.fail_finish = true,
        |e: &CompressError| matches!(e, CompressError::WriterFailed(_))
    )]
    #[case::append(
        |c: &mut StubConfig| c.fail_append = Some((MediaKind::Video, 2)),
        |e: &CompressError| matches!(e, CompressError::WriterFailed(_))
    )]
    fn test_setup_failures_leave_no_output(
        #[case] configure: fn(&mut StubConfig),
        #[case] expected: fn(&CompressError) -> bool,
    ) {
        let mut config = StubConfig::audio_video(1.0, 4);
        configure(&mut config);
        let fx = Fixture::new(config);

        let err = fx
            .compressor
            .compress(&fx.source, CompressOptions::default())
            .unwrap_err();

        assert!(expected(&err), "unexpected error: {err}");
        assert_eq!(fx.count("out"), 0);
        assert_eq!(fx.count("tmp"), 0);
    }

    #[test]
    fn test_mid_copy_source_failure_is_reported() {
        let mut config = StubConfig::audio_video(1.0, 6);
        config.fail_source_after = Some(3);
        let fx = Fixture::new(config);

        let err = fx
            .compressor
            .compress(&fx.source, CompressOptions::default())
            .unwrap_err();

        match err {
            CompressError::SourceFailed { kind, reason } => {
                assert_eq!(kind, MediaKind::Video);
                assert_eq!(reason, "corrupt packet");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.count("out"), 0);
        fx.backend.record(|r| {
            assert_eq!(r.cancelled_mux, 1);
            assert_eq!(r.cancelled_demux, 1);
        });
    }

    #[test]
    fn test_cancel_during_copy() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 10));
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let options = CompressOptions {
            cancelled,
            ..CompressOptions::default()
        }
        .with_progress(Arc::new(move |fraction: f64, _: Option<&str>| {
            if fraction >= 0.3 {
                flag.store(true, Ordering::SeqCst);
            }
        }));

        let err = fx.compressor.compress(&fx.source, options).unwrap_err();

        assert!(matches!(err, CompressError::Cancelled));
        assert_eq!(fx.count("out"), 0);
        assert_eq!(fx.count("tmp"), 0);
    }

    #[test]
    fn test_cancel_before_start_skips_reader() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3));
        let options = CompressOptions::default();
        options.cancelled.store(true, Ordering::SeqCst);

        let err = fx.compressor.compress(&fx.source, options).unwrap_err();

        assert!(matches!(err, CompressError::Cancelled));
        assert_eq!(fx.backend.opened(), 0);
    }

    #[test]
    fn test_same_asset_twice_gives_distinct_outputs() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 3));
        let first = fx
            .compressor
            .compress(&fx.source, CompressOptions::default())
            .unwrap();
        let second = fx
            .compressor
            .compress(&fx.source, CompressOptions::default())
            .unwrap();

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        assert_eq!(fx.count("out"), 2);
    }

    #[test]
    fn test_concurrent_operations_keep_identifiers_apart() {
        let fx = Fixture::new(StubConfig::audio_video(1.0, 8));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let sink = seen.clone();
                let options = CompressOptions::default()
                    .with_identifier(id)
                    .with_progress(Arc::new(move |fraction: f64, tag: Option<&str>| {
                        sink.lock().unwrap().push((fraction, tag.map(str::to_string)));
                    }));
                fx.compressor
                    .compress_with_callback(fx.source.clone(), options, |r| {
                        assert!(r.is_ok());
                    })
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut by_id: HashMap<String, Vec<f64>> = HashMap::new();
        for (fraction, id) in seen.lock().unwrap().iter() {
            by_id.entry(id.clone().unwrap()).or_default().push(*fraction);
        }
        assert_eq!(by_id.len(), 3);
        for fractions in by_id.values() {
            // 8 video samples plus the final 1.0.
            assert_eq!(fractions.len(), 9);
            assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
            assert_relative_eq!(*fractions.last().unwrap(), 1.0);
        }
        assert_eq!(fx.count("out"), 3);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(CompressStage::Materializing.to_string(), "materializing");
        assert_eq!(CompressStage::Finalizing.to_string(), "finalizing");
    }
}
