use std::path::Path;

use crate::media::domain::demux_session::{DemuxSession, MediaError};
use crate::media::domain::mux_session::{MuxOptions, MuxSession};

/// Opens reading and writing sessions on the host media stack.
pub trait MediaBackend: Send + Sync {
    fn open_demux(&self, path: &Path) -> Result<Box<dyn DemuxSession>, MediaError>;

    fn create_mux(
        &self,
        path: &Path,
        options: &MuxOptions,
    ) -> Result<Box<dyn MuxSession>, MediaError>;
}
