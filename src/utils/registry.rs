//! Model registry access (Hugging Face hub layout).
//!
//! Files are fetched once into the cache and reused on later runs. A model
//! key that names an existing local directory is used as-is.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const ENDPOINT_ENV: &str = "HF_ENDPOINT";
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const REQUIRED_FILES: [&str; 2] = [CONFIG_FILE, WEIGHTS_FILE];

/// Local paths of a model's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub model_id: String,
    pub config: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    fn in_dir(model_id: &str, dir: &Path) -> Self {
        Self {
            model_id: model_id.to_string(),
            config: dir.join(CONFIG_FILE),
            weights: dir.join(WEIGHTS_FILE),
        }
    }

    fn complete(&self) -> bool {
        self.config.is_file() && self.weights.is_file()
    }
}

pub fn endpoint() -> String {
    std::env::var(ENDPOINT_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

pub fn file_url(endpoint: &str, model_id: &str, file: &str) -> String {
    format!(
        "{}/{}/resolve/main/{}",
        endpoint.trim_end_matches('/'),
        model_id,
        file
    )
}

/// Cache directory for one model, `org/name` stored as `org--name`.
pub fn model_cache_dir(cache_home: &Path, model_id: &str) -> PathBuf {
    cache_home.join("models").join(model_id.replace('/', "--"))
}

/// Resolves `model_id` to local files, downloading whatever is missing.
pub fn fetch_model(model_id: &str) -> Result<ModelFiles> {
    let local = Path::new(model_id);
    if local.is_dir() {
        let files = ModelFiles::in_dir(model_id, local);
        if !files.complete() {
            bail!(
                "local model directory {} must contain {} and {}",
                local.display(),
                CONFIG_FILE,
                WEIGHTS_FILE
            );
        }
        log::info!("Using local model files from {}", local.display());
        return Ok(files);
    }

    let dir = model_cache_dir(&super::cache_home(), model_id);
    std::fs::create_dir_all(&dir).context("Failed to create cache directory")?;
    let files = ModelFiles::in_dir(model_id, &dir);
    if files.complete() {
        log::info!("Using cached {} from {}", model_id, dir.display());
        return Ok(files);
    }

    let endpoint = endpoint();
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    for file in REQUIRED_FILES {
        let target = dir.join(file);
        if target.is_file() {
            continue;
        }
        download(&client, &file_url(&endpoint, model_id, file), &target)
            .with_context(|| format!("Failed to download {} for {}", file, model_id))?;
    }
    Ok(files)
}

fn download(client: &reqwest::blocking::Client, url: &str, target: &Path) -> Result<()> {
    log::info!("Downloading {}", url);
    let mut response = client.get(url).send()?.error_for_status()?;
    let total_size = response.content_length().unwrap_or(0);
    if total_size == 0 {
        log::warn!("{} did not report a content length", url);
    }

    let partial = target.with_extension("part");
    let mut file = File::create(&partial)?;
    let mut downloaded: u64 = 0;
    let mut last_percent = 0;
    let mut buffer = [0; 8192];

    loop {
        let n = response.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])?;
        downloaded += n as u64;

        if total_size > 0 {
            let percent = (downloaded * 100 / total_size) as u8;
            if percent > last_percent && percent % 10 == 0 {
                log::info!(
                    "Download progress: {}% ({:.1}/{:.1} MB)",
                    percent,
                    super::megabytes(downloaded),
                    super::megabytes(total_size)
                );
                last_percent = percent;
            }
        }
    }
    file.flush()?;
    drop(file);

    if total_size > 0 && downloaded != total_size {
        bail!("truncated download: got {} of {} bytes", downloaded, total_size);
    }
    std::fs::rename(&partial, target)?;
    log::info!("Saved {} ({:.1} MB)", target.display(), super::megabytes(downloaded));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_resolve_urls() {
        assert_eq!(
            file_url("https://huggingface.co/", "openai/whisper-tiny", "config.json"),
            "https://huggingface.co/openai/whisper-tiny/resolve/main/config.json"
        );
    }

    #[test]
    fn cache_dir_flattens_namespaces() {
        let dir = model_cache_dir(Path::new("/cache"), "openai/whisper-tiny");
        assert_eq!(dir, PathBuf::from("/cache/models/openai--whisper-tiny"));
    }

    #[test]
    fn local_directory_is_used_without_network() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        std::fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        let key = dir.path().to_str().unwrap();
        let files = fetch_model(key).unwrap();
        assert_eq!(files.config, dir.path().join(CONFIG_FILE));
        assert_eq!(files.weights, dir.path().join(WEIGHTS_FILE));
        assert_eq!(files.model_id, key);
    }

    #[test]
    fn incomplete_local_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        let err = fetch_model(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains(WEIGHTS_FILE));
    }
}
