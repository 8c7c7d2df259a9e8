pub mod registry;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::contract::ARTIFACT_FILE_NAME;

/// Environment override for the model cache directory.
pub const CACHE_ENV: &str = "WHISPER_EXPORT_CACHE";
/// Environment override for the project root used by the default output path.
pub const PROJECT_ROOT_ENV: &str = "WHISPER_EXPORT_PROJECT_ROOT";

/// Cache home directory for downloaded model files
pub fn cache_home() -> PathBuf {
    if let Some(dir) = std::env::var_os(CACHE_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(cache_dir) = dirs::cache_dir() {
        cache_dir.join("whisper_phoneme_export")
    } else {
        std::env::temp_dir().join("whisper_phoneme_export")
    }
}

/// Root of the app repository this crate lives in.
///
/// The crate sits one level below the root, next to `app/`.
pub fn project_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(PROJECT_ROOT_ENV) {
        return PathBuf::from(dir);
    }
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest.to_path_buf())
}

/// `<root>/app/src/main/assets/whisper-tiny-phoneme-ctc.onnx`
pub fn default_output_path_in(root: impl AsRef<Path>) -> PathBuf {
    root.as_ref()
        .join("app")
        .join("src")
        .join("main")
        .join("assets")
        .join(ARTIFACT_FILE_NAME)
}

pub fn default_output_path() -> PathBuf {
    default_output_path_in(project_root())
}

/// Creates the parent directory of `path` if needed.
pub fn ensure_parent_dir(path: impl AsRef<Path>) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Byte count as megabytes (2^20).
pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_lands_in_app_assets() {
        let path = default_output_path_in("/work/deeplayer");
        assert_eq!(
            path,
            PathBuf::from("/work/deeplayer/app/src/main/assets/whisper-tiny-phoneme-ctc.onnx")
        );
    }

    #[test]
    fn ensure_parent_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("model.onnx");
        ensure_parent_dir(&path).unwrap();
        ensure_parent_dir(&path).unwrap();
        assert!(dir.path().join("a").join("b").is_dir());
        // A bare file name has no directory to create.
        ensure_parent_dir("model.onnx").unwrap();
    }

    #[test]
    fn megabytes_uses_binary_units() {
        assert_eq!(megabytes(1_048_576), 1.0);
        assert_eq!(format!("{:.1}", megabytes(33_554_432 + 104_858)), "32.1");
    }
}
