//! Copy mechanism seam: opening the raw bytes of an asset.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use fft_player_types::{AssetDescriptor, AssetId};

/// Why an asset's bytes cannot be read.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("asset {0} is copy-protected")]
    DrmBlocked(AssetId),
    #[error("asset {id} is unavailable: {source}")]
    Unavailable {
        id: AssetId,
        #[source]
        source: std::io::Error,
    },
}

/// Raw byte stream of an asset plus its total length when known.
pub struct OpenedAsset {
    pub reader: Box<dyn Read + Send>,
    pub byte_len: Option<u64>,
}

/// Opens asset bytes for copying. Implementations reject protected assets
/// with [`AcquireError::DrmBlocked`].
pub trait AssetReader: Send + Sync + 'static {
    fn open(&self, asset: &AssetDescriptor) -> Result<OpenedAsset, AcquireError>;
}

/// Reads assets whose locator is a filesystem path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileAssetReader;

impl AssetReader for FileAssetReader {
    fn open(&self, asset: &AssetDescriptor) -> Result<OpenedAsset, AcquireError> {
        if asset.drm_protected {
            return Err(AcquireError::DrmBlocked(asset.id.clone()));
        }
        let unavailable = |source| AcquireError::Unavailable {
            id: asset.id.clone(),
            source,
        };
        let path = Path::new(&asset.locator);
        let file = File::open(path).map_err(unavailable)?;
        let byte_len = file.metadata().map_err(unavailable)?.len();
        Ok(OpenedAsset {
            reader: Box::new(file),
            byte_len: Some(byte_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_asset_is_rejected_before_opening() {
        let asset = AssetDescriptor::new("1", "Song", "/does/not/matter.m4p").with_drm(true);
        let err = FileAssetReader.open(&asset).err().unwrap();
        assert!(matches!(err, AcquireError::DrmBlocked(id) if id.as_str() == "1"));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let asset = AssetDescriptor::new("2", "Song", "/does/not/exist.flac");
        let err = FileAssetReader.open(&asset).err().unwrap();
        assert!(matches!(err, AcquireError::Unavailable { .. }));
        assert!(err.to_string().contains("asset 2 is unavailable"));
    }

    #[test]
    fn existing_file_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        std::fs::write(&path, b"abcdef").unwrap();
        let asset = AssetDescriptor::new("3", "Song", path.to_string_lossy());
        let mut opened = FileAssetReader.open(&asset).unwrap();
        assert_eq!(opened.byte_len, Some(6));
        let mut buf = String::new();
        opened.reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abcdef");
    }
}
