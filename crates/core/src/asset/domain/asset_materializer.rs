use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::shared::source_asset::SourceAsset;

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write materialized copy to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no byte source for {0}")]
    Unresolvable(String),
}

/// A local copy of a source asset's bytes.
///
/// Owns the file: it is deleted when this value is dropped.
#[derive(Debug)]
pub struct MaterializedAsset {
    path: tempfile::TempPath,
}

impl MaterializedAsset {
    pub fn new(path: tempfile::TempPath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Forces an asset's bytes into a local file before any demuxing starts,
/// so reads never stall on a remote or not-yet-resident store.
pub trait AssetMaterializer: Send + Sync {
    fn materialize(&self, asset: &SourceAsset) -> Result<MaterializedAsset, MaterializeError>;
}
