use std::sync::atomic::{AtomicBool, Ordering};

use crate::media::domain::demux_session::{DemuxStatus, DemuxStatusHandle, TrackOutput};
use crate::media::domain::mux_session::TrackInput;
use crate::shared::progress::ProgressReporter;
use crate::shared::track_info::MediaKind;
use crate::transcode::compress_error::CompressError;

/// Result of copying one track to completion.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CopyOutcome {
    pub samples: usize,
    pub last_timestamp: Option<f64>,
    /// Samples that had to wait for the input to become ready.
    pub stalls: usize,
}

/// Moves every sample from `output` into `input`, in order.
///
/// Both ends are consumed: the input is marked finished on every exit path
/// and the output is dropped, so the demuxer stops feeding this track.
/// Progress is reported for video only, with a final 1.0 on completion.
pub fn copy_track(
    mut output: Box<dyn TrackOutput>,
    mut input: Box<dyn TrackInput>,
    status: &DemuxStatusHandle,
    cancelled: &AtomicBool,
    progress: Option<ProgressReporter>,
) -> Result<CopyOutcome, CompressError> {
    let kind = output.track().kind;
    let mut progress = progress.filter(|_| kind == MediaKind::Video);
    let mut outcome = CopyOutcome::default();

    let result = loop {
        if cancelled.load(Ordering::Relaxed) {
            break Err(CompressError::Cancelled);
        }

        let Some(sample) = output.next_sample() else {
            break match status.get() {
                DemuxStatus::Completed => {
                    if let Some(reporter) = progress.as_mut() {
                        reporter.complete();
                    }
                    Ok(outcome)
                }
                DemuxStatus::Failed(reason) => Err(CompressError::SourceFailed { kind, reason }),
                DemuxStatus::Cancelled => Err(CompressError::Cancelled),
                DemuxStatus::NotStarted | DemuxStatus::Reading => {
                    Err(CompressError::SourceFailed {
                        kind,
                        reason: "track output closed while the reader was still active".into(),
                    })
                }
            };
        };

        let timestamp = sample.timestamp();
        if !input.is_ready_for_more() {
            outcome.stalls += 1;
        }
        if let Err(e) = input.append(sample) {
            break Err(CompressError::WriterFailed(e));
        }
        outcome.samples += 1;
        outcome.last_timestamp = Some(timestamp);
        if let Some(reporter) = progress.as_mut() {
            reporter.report(timestamp);
        }
    };

    input.mark_finished();
    drop(output);

    match &result {
        Ok(done) => log::debug!(
            "{kind} track copied: {} samples, {} waits on the writer",
            done.samples,
            done.stalls
        ),
        Err(e) => log::debug!("{kind} track stopped after {} samples: {e}", outcome.samples),
    }
    result
}
