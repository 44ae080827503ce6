use std::path::{Path, PathBuf};

use anyhow::Result;

use fft_player::PlayerConfig;
use fft_player_types::AssetDescriptor;

/// Locator extensions that are always copy-protected.
const PROTECTED_EXTENSIONS: &[&str] = &["m4p"];

#[derive(Clone, Debug)]
pub struct PlayOptions {
    pub assets: Vec<AssetDescriptor>,
    pub random: bool,
    pub circle: bool,
    pub bars: usize,
    pub player: PlayerConfig,
}

/// Load the config file (if any) and apply command-line overrides.
pub fn resolve_player_config(
    config: Option<&Path>,
    device: Option<String>,
    cache_dir: Option<PathBuf>,
) -> Result<PlayerConfig> {
    let mut player = match config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if device.is_some() {
        player.device = device;
    }
    if let Some(dir) = cache_dir {
        player.acquire.cache_dir = dir;
    }
    Ok(player.sanitized())
}

/// One asset per path; the id is the absolute path when it can be resolved.
pub fn assets_from_paths(paths: &[PathBuf]) -> Vec<AssetDescriptor> {
    paths.iter().map(|path| asset_from_path(path)).collect()
}

fn asset_from_path(path: &Path) -> AssetDescriptor {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let id = absolute.to_string_lossy().into_owned();
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.clone());
    let protected = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            PROTECTED_EXTENSIONS
                .iter()
                .any(|p| ext.eq_ignore_ascii_case(p))
        });
    AssetDescriptor::new(id.clone(), title, id).with_drm(protected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assets_use_file_stem_as_title_and_flag_m4p() {
        let assets = assets_from_paths(&[
            PathBuf::from("/music/Intro.flac"),
            PathBuf::from("/music/Bought.M4P"),
        ]);
        assert_eq!(assets[0].title, "Intro");
        assert!(!assets[0].drm_protected);
        assert_eq!(assets[1].title, "Bought");
        assert!(assets[1].drm_protected);
        assert_eq!(assets[0].locator, "/music/Intro.flac");
    }

    #[test]
    fn existing_paths_are_made_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("song.wav");
        std::fs::write(&file, b"RIFF").unwrap();
        let assets = assets_from_paths(&[file.clone()]);
        let expected = std::fs::canonicalize(&file).unwrap();
        assert_eq!(assets[0].id.as_str(), expected.to_string_lossy());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.toml");
        std::fs::write(
            &path,
            "device = \"Speakers\"\n[acquire]\ncache_dir = \"/var/cache/fft\"\n",
        )
        .unwrap();

        let cfg = resolve_player_config(Some(&path), None, None).unwrap();
        assert_eq!(cfg.device.as_deref(), Some("Speakers"));
        assert_eq!(cfg.acquire.cache_dir, PathBuf::from("/var/cache/fft"));

        let cfg = resolve_player_config(
            Some(&path),
            Some("USB".to_string()),
            Some(PathBuf::from("/tmp/copies")),
        )
        .unwrap();
        assert_eq!(cfg.device.as_deref(), Some("USB"));
        assert_eq!(cfg.acquire.cache_dir, PathBuf::from("/tmp/copies"));
    }

    #[test]
    fn blank_device_flag_falls_back_to_default() {
        let cfg = resolve_player_config(None, Some("  ".to_string()), None).unwrap();
        assert!(cfg.device.is_none());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = resolve_player_config(Some(Path::new("/nonexistent/fft.toml")), None, None)
            .unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
