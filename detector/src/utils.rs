//! Utility functions
//!
use std::{
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
};

use reqwest::Client;

use crate::nn::ModelError;

/// Download a file from a URL to a given filepath.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<Path>,
) -> Result<(), ModelError> {
    let fetch_err = |reason: String| ModelError::Fetch {
        location: url.to_owned(),
        reason,
    };

    let resp = client
        .get(url)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| fetch_err(e.to_string()))?;

    let mut file = File::create(filepath).map_err(|e| fetch_err(e.to_string()))?;
    let mut content = Cursor::new(resp.bytes().await.map_err(|e| fetch_err(e.to_string()))?);
    std::io::copy(&mut content, &mut file).map_err(|e| fetch_err(e.to_string()))?;

    Ok(())
}

/// Whether a model location points to a remote server.
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Path under `cache_dir` where a remote model is stored.
pub fn cached_model_path(url: &str, cache_dir: &Path) -> PathBuf {
    let file_name = url
        .split(|c| c == '?' || c == '#')
        .next()
        .and_then(|path| path.rsplit('/').find(|segment| !segment.is_empty()))
        .filter(|segment| !segment.contains(':'))
        .unwrap_or("model.onnx");

    cache_dir.join(file_name)
}

/// Default directory for downloaded models.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("detector")
}

/// Resolve a model location to a local file, downloading remote models once.
pub async fn resolve_model_location(
    location: &str,
    cache_dir: Option<&Path>,
) -> Result<PathBuf, ModelError> {
    if !is_remote(location) {
        let path = PathBuf::from(location);
        if !path.is_file() {
            return Err(ModelError::Fetch {
                location: location.to_owned(),
                reason: "no such file".into(),
            });
        }
        return Ok(path);
    }

    let cache_dir = cache_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(default_cache_dir);
    let filepath = cached_model_path(location, &cache_dir);

    if filepath.is_file() {
        log::info!("Using cached model {}", filepath.display());
        return Ok(filepath);
    }

    std::fs::create_dir_all(&cache_dir).map_err(|e| ModelError::Fetch {
        location: location.to_owned(),
        reason: format!("cannot create cache dir {}: {e}", cache_dir.display()),
    })?;

    log::info!("Downloading model from {}", location);
    let partial = filepath.with_extension("part");
    download_file(&Client::new(), location, &partial).await?;
    std::fs::rename(&partial, &filepath).map_err(|e| ModelError::Fetch {
        location: location.to_owned(),
        reason: e.to_string(),
    })?;
    log::info!("Stored model at {}", filepath.display());

    Ok(filepath)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detect_remote_locations() {
        assert!(is_remote("https://example.com/model.onnx"));
        assert!(is_remote("http://127.0.0.1:8080/model.onnx"));
        assert!(!is_remote("models/model.onnx"));
        assert!(!is_remote("/abs/https/model.onnx"));
    }

    #[test]
    fn derive_cache_file_name() {
        let dir = Path::new("/cache");

        assert_eq!(
            cached_model_path("https://host/models/kangaroo.onnx?raw=true", dir),
            dir.join("kangaroo.onnx")
        );
        assert_eq!(
            cached_model_path("http://127.0.0.1:8080/", dir),
            dir.join("model.onnx")
        );
    }

    #[tokio::test]
    async fn resolve_local_model() -> Result<(), Box<dyn std::error::Error>> {
        let file = tempfile::NamedTempFile::new()?;
        let location = file.path().to_string_lossy().to_string();

        let path = resolve_model_location(&location, None).await?;
        assert_eq!(path, file.path());

        let missing = resolve_model_location("does/not/exist.onnx", None).await;
        assert!(matches!(missing, Err(ModelError::Fetch { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn reuse_cached_remote_model() -> Result<(), Box<dyn std::error::Error>> {
        let cache_dir = tempfile::tempdir()?;
        let url = "https://unreachable.invalid/models/kangaroo.onnx";
        std::fs::write(cache_dir.path().join("kangaroo.onnx"), b"graph")?;

        let path = resolve_model_location(url, Some(cache_dir.path())).await?;

        assert_eq!(path, cache_dir.path().join("kangaroo.onnx"));

        Ok(())
    }
}
