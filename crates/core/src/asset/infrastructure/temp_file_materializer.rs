use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::asset::domain::asset_materializer::{
    AssetMaterializer, MaterializeError, MaterializedAsset,
};
use crate::shared::constants::{MATERIALIZED_EXTENSION, MATERIALIZED_PREFIX};
use crate::shared::source_asset::SourceAsset;

/// Copies asset bytes into a randomly named file under `temp_dir`.
///
/// Local files are re-read and rewritten rather than used in place, so the
/// demuxer always sees a private copy. Remote assets are fetched over HTTP.
pub struct TempFileMaterializer {
    temp_dir: PathBuf,
}

impl TempFileMaterializer {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    fn write_copy(&self, bytes: &[u8]) -> Result<MaterializedAsset, MaterializeError> {
        let write_err = |source| MaterializeError::Write {
            path: self.temp_dir.clone(),
            source,
        };

        let mut file = tempfile::Builder::new()
            .prefix(MATERIALIZED_PREFIX)
            .suffix(&format!(".{MATERIALIZED_EXTENSION}"))
            .tempfile_in(&self.temp_dir)
            .map_err(write_err)?;

        file.write_all(bytes).map_err(write_err)?;
        file.flush().map_err(write_err)?;

        let path = file.into_temp_path();
        log::debug!("Materialized {} bytes to {}", bytes.len(), path.display());
        Ok(MaterializedAsset::new(path))
    }
}

impl Default for TempFileMaterializer {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl AssetMaterializer for TempFileMaterializer {
    fn materialize(&self, asset: &SourceAsset) -> Result<MaterializedAsset, MaterializeError> {
        let bytes = match asset {
            SourceAsset::File(path) => read_local(path)?,
            SourceAsset::Remote(url) => download(url)?,
            SourceAsset::Unresolvable(uri) => {
                return Err(MaterializeError::Unresolvable(uri.clone()))
            }
        };
        self.write_copy(&bytes)
    }
}

fn read_local(path: &Path) -> Result<Vec<u8>, MaterializeError> {
    fs::read(path).map_err(|e| MaterializeError::Read {
        path: path.to_path_buf(),
        source: e,
    })
}

fn download(url: &str) -> Result<Vec<u8>, MaterializeError> {
    let download_err = |e| MaterializeError::Download {
        url: url.to_string(),
        source: e,
    };

    log::debug!("Fetching remote asset {url}");
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(download_err)?;
    let bytes = response.bytes().map_err(download_err)?;
    Ok(bytes.to_vec())
}
