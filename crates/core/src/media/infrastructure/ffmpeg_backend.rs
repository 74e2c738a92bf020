use std::path::Path;

use crate::media::domain::demux_session::{DemuxSession, MediaError};
use crate::media::domain::media_backend::MediaBackend;
use crate::media::domain::mux_session::{MuxOptions, MuxSession};
use crate::media::infrastructure::ffmpeg_demux_session::FfmpegDemuxSession;
use crate::media::infrastructure::ffmpeg_mux_session::FfmpegMuxSession;

/// Media backend on top of the linked FFmpeg libraries.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    fn open_demux(&self, path: &Path) -> Result<Box<dyn DemuxSession>, MediaError> {
        Ok(Box::new(FfmpegDemuxSession::open(path)?))
    }

    fn create_mux(
        &self,
        path: &Path,
        options: &MuxOptions,
    ) -> Result<Box<dyn MuxSession>, MediaError> {
        Ok(Box::new(FfmpegMuxSession::create(path, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::infrastructure::test_clip::{write_test_clip, ClipParams};
    use crate::shared::source_asset::SourceAsset;
    use crate::shared::track_info::MediaKind;
    use crate::transcode::compress_options::CompressOptions;
    use crate::transcode::compressor::Compressor;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_open_demux_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FfmpegBackend.open_demux(&dir.path().join("nope.mov")).is_err());
    }

    #[test]
    fn test_open_demux_reads_clip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        write_test_clip(&path, &ClipParams::default());

        let session = FfmpegBackend.open_demux(&path).unwrap();
        assert_eq!(session.asset_info().tracks.len(), 2);
    }

    #[test]
    fn test_create_mux_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.mp4");
        assert!(FfmpegBackend.create_mux(&path, &MuxOptions::default()).is_err());
    }

    #[rstest]
    #[case::landscape(0)]
    #[case::portrait(90)]
    #[case::upside_down(180)]
    fn test_compress_end_to_end(#[case] rotation: i32) {
        ffmpeg_next::init().unwrap();
        if ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264).is_none() {
            eprintln!("skipping: no H.264 encoder in this ffmpeg build");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        write_test_clip(
            &source,
            &ClipParams {
                frames: 48,
                rotation,
                ..ClipParams::default()
            },
        );

        let compressor = Compressor::with_ffmpeg(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CompressOptions::default()
            .with_identifier(format!("e2e-{rotation}"))
            .with_progress(Arc::new(move |fraction: f64, _: Option<&str>| {
                sink.lock().unwrap().push(fraction);
            }));

        let output = compressor
            .compress(&SourceAsset::File(source.clone()), options)
            .unwrap();

        let source_info = FfmpegBackend.open_demux(&source).unwrap().asset_info().clone();
        let output_session = FfmpegBackend.open_demux(&output).unwrap();
        let info = output_session.asset_info();
        let video = info.first_track(MediaKind::Video).unwrap();
        let audio = info.first_track(MediaKind::Audio).unwrap();
        assert_eq!(source_info.first_track(MediaKind::Video).unwrap().rotation, rotation);
        assert_eq!(video.natural_size(), Some((160, 120)));
        assert_eq!(video.rotation, rotation);
        assert_eq!((audio.sample_rate, audio.channels), (44_100, 2));
        assert_relative_eq!(info.duration_secs, source_info.duration_secs, epsilon = 0.25);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(*seen.last().unwrap(), 1.0);
    }
}
