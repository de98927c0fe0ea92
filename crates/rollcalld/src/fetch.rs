//! Reference photo loading for enrollment.

use async_trait::async_trait;
use rollcall_core::{FetchError, GrayFrame, ReferenceFetcher};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches `http(s)://` URIs with reqwest and reads `file://` URIs or plain
/// paths from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("rollcalld/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch_bytes(&self, uri: &str) -> Result<Vec<u8>, FetchError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let response = self
                .client
                .get(uri)
                .send()
                .await
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;
            Ok(body.to_vec())
        } else {
            let path = uri.strip_prefix("file://").unwrap_or(uri);
            tokio::fs::read(path)
                .await
                .map_err(|e| FetchError::Unreachable(format!("{path}: {e}")))
        }
    }
}

#[async_trait]
impl ReferenceFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<GrayFrame, FetchError> {
        let bytes = self.fetch_bytes(uri).await?;
        let frame = GrayFrame::decode(&bytes).map_err(|e| FetchError::Decode(e.to_string()))?;
        tracing::debug!(uri, width = frame.width, height = frame.height, "reference image fetched");
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rollcalld-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn test_fetch_local_png() {
        let img = GrayImage::from_pixel(4, 3, Luma([90]));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();
        let path = temp_path("face.png");
        std::fs::write(&path, &png).unwrap();

        let fetcher = HttpFetcher::new().unwrap();
        let uri = format!("file://{}", path.display());
        let frame = fetcher.fetch(&uri).await.unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert!(frame.data.iter().all(|&p| p == 90));

        let plain = fetcher.fetch(path.to_str().unwrap()).await.unwrap();
        assert_eq!(plain, frame);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_unreachable() {
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher.fetch("/nonexistent/rollcall/face.png").await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let path = temp_path("garbage.png");
        std::fs::write(&path, b"not an image").unwrap();
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher.fetch(path.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
        std::fs::remove_file(&path).ok();
    }
}
