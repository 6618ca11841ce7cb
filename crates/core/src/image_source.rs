use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::DynamicImage;

/// Resolves image references that are not part of the prompt's own image map.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, location: &str) -> Result<DynamicImage>;
}

/// Rejects every reference; prompts may only use embedded parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFetch;

impl ImageFetcher for NoFetch {
    fn fetch(&self, location: &str) -> Result<DynamicImage> {
        bail!("image `{location}` is not an embedded part and external references are disabled")
    }
}

/// Opens references as filesystem paths, optionally relative to a root directory.
#[derive(Debug, Clone, Default)]
pub struct LocalImageFetcher {
    root: Option<PathBuf>,
}

impl LocalImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve_path(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ImageFetcher for LocalImageFetcher {
    fn fetch(&self, location: &str) -> Result<DynamicImage> {
        if is_remote(location) {
            bail!("remote image `{location}` requires the `remote-images` feature");
        }
        let path = self.resolve_path(location);
        image::open(&path).with_context(|| format!("failed to open image at {}", path.display()))
    }
}

pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

#[cfg(feature = "remote-images")]
pub use remote::HttpImageFetcher;

#[cfg(feature = "remote-images")]
mod remote {
    use std::time::Duration;

    use anyhow::{Context, Result, anyhow, ensure};
    use image::DynamicImage;
    use once_cell::sync::OnceCell;
    use reqwest::blocking::Client;
    use tracing::debug;

    use super::{ImageFetcher, LocalImageFetcher, is_remote};

    const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
    const MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;

    static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

    fn http_client() -> Result<&'static Client> {
        HTTP_CLIENT.get_or_try_init(|| {
            Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .map_err(|err| anyhow!("failed to build HTTP client: {err}"))
        })
    }

    /// Downloads `http(s)://` references and defers everything else to a local fetcher.
    #[derive(Debug, Clone, Default)]
    pub struct HttpImageFetcher {
        local: LocalImageFetcher,
    }

    impl HttpImageFetcher {
        pub fn new(local: LocalImageFetcher) -> Self {
            Self { local }
        }
    }

    impl ImageFetcher for HttpImageFetcher {
        fn fetch(&self, location: &str) -> Result<DynamicImage> {
            if !is_remote(location) {
                return self.local.fetch(location);
            }
            debug!(url = location, "downloading prompt image");
            let response = http_client()?
                .get(location)
                .send()
                .with_context(|| format!("failed to request {location}"))?;
            let status = response.status();
            ensure!(status.is_success(), "download of {location} failed with {status}");
            let bytes = response
                .bytes()
                .with_context(|| format!("failed to read body of {location}"))?;
            ensure!(
                bytes.len() <= MAX_IMAGE_BYTES,
                "image at {location} exceeds {MAX_IMAGE_BYTES} bytes"
            );
            image::load_from_memory(&bytes)
                .with_context(|| format!("failed to decode image downloaded from {location}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_fetch_always_fails() {
        assert!(NoFetch.fetch("cat.png").is_err());
    }

    #[test]
    fn local_fetcher_rejects_urls_and_missing_files() {
        let fetcher = LocalImageFetcher::with_root("/nonexistent-root");
        assert!(fetcher.fetch("https://example.com/cat.png").is_err());
        assert!(fetcher.fetch("cat.png").is_err());
        assert_eq!(
            fetcher.resolve_path("cat.png"),
            PathBuf::from("/nonexistent-root/cat.png")
        );
        assert_eq!(fetcher.resolve_path("/abs.png"), PathBuf::from("/abs.png"));
    }
}
