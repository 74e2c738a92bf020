use thiserror::Error;

use crate::asset::domain::asset_materializer::MaterializeError;
use crate::media::domain::demux_session::MediaError;
use crate::shared::track_info::MediaKind;

/// Why a compress operation did not produce an output file.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("asset data unavailable: {0}")]
    AssetDataUnavailable(#[source] MaterializeError),
    #[error("could not open the asset for reading: {0}")]
    ReaderCreationFailed(#[source] MediaError),
    #[error("could not create the output writer: {0}")]
    WriterCreationFailed(#[source] MediaError),
    #[error("asset has no video track")]
    NoVideoTrack,
    #[error("asset has no audio track")]
    AudioTrackMissing,
    #[error("could not attach the video track output: {0}")]
    VideoOutputAttachFailed(#[source] MediaError),
    #[error("could not attach the audio track output: {0}")]
    AudioOutputAttachFailed(#[source] MediaError),
    #[error("could not attach the {kind} writer input: {source}")]
    InputAttachFailed {
        kind: MediaKind,
        #[source]
        source: MediaError,
    },
    #[error("reading the {kind} track failed: {reason}")]
    SourceFailed { kind: MediaKind, reason: String },
    #[error("writing the output failed: {0}")]
    WriterFailed(#[source] MediaError),
    #[error("compression was cancelled")]
    Cancelled,
    #[error("{0} worker stopped before reporting a result")]
    Interrupted(String),
    #[error("output file is not readable: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_video(CompressError::NoVideoTrack, "asset has no video track")]
    #[case::no_audio(CompressError::AudioTrackMissing, "asset has no audio track")]
    #[case::source_failed(
        CompressError::SourceFailed { kind: MediaKind::Audio, reason: "corrupt".into() },
        "reading the audio track failed: corrupt"
    )]
    #[case::input_attach(
        CompressError::InputAttachFailed { kind: MediaKind::Video, source: "busy".into() },
        "could not attach the video writer input: busy"
    )]
    #[case::interrupted(
        CompressError::Interrupted("video-copy".into()),
        "video-copy worker stopped before reporting a result"
    )]
    fn test_display(#[case] error: CompressError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[test]
    fn test_asset_data_unavailable_keeps_source() {
        let error = CompressError::AssetDataUnavailable(MaterializeError::Unresolvable(
            "ph://123".into(),
        ));
        assert!(std::error::Error::source(&error).is_some());
    }
}
