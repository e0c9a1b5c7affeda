use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

use super::backoff::Backoff;
use super::paths::assets_dir;

const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("download returned {status}")]
    Api { status: StatusCode },
}

impl TransferError {
    fn is_transient(&self) -> bool {
        match self {
            TransferError::Request(err) => err.is_timeout() || err.is_connect(),
            TransferError::Api { status } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloaderConfig {
    pub chunk_size: u64,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }
}

enum Chunk {
    /// 206 with this chunk's bytes and, when the server sent a usable
    /// Content-Range, the total resource length.
    Part { bytes: Vec<u8>, total: Option<u64> },
    /// 200: the server ignored the range request and sent everything.
    Whole(Vec<u8>),
    /// 416: the requested offset is past the end.
    Exhausted,
}

/// Downloads node attachments into a per-node `assets/` directory, chunked
/// with ranged requests. Transient failures retry the remaining-chunk loop
/// with linear backoff; a failure here never aborts sibling downloads (the
/// coordinator collects per-resource results).
#[derive(Clone)]
pub struct AttachmentDownloader {
    http: Client,
    config: DownloaderConfig,
    backoff: Backoff,
}

impl AttachmentDownloader {
    pub fn new() -> Self {
        Self::with_config(DownloaderConfig::default())
    }

    pub fn with_config(config: DownloaderConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            backoff: Backoff::new(config.retry_base),
        }
    }

    /// Fetch `url` into `<node_dir>/assets/<resource_id><ext>`, writing to a
    /// `.partial` path and renaming once the content is complete on disk.
    pub async fn save(
        &self,
        node_dir: &Path,
        resource_id: &str,
        url_str: &str,
    ) -> Result<PathBuf, TransferError> {
        let url = Url::parse(url_str)?;
        let assets = assets_dir(node_dir);
        tokio::fs::create_dir_all(&assets).await?;
        let target = assets.join(asset_file_name(resource_id, &url));
        let partial = partial_path(&target);

        let mut file = tokio::fs::File::create(&partial).await?;
        let mut offset = 0u64;
        let mut attempt = 0u32;

        loop {
            match self.fetch_chunk(&url, offset).await {
                Ok(Chunk::Whole(bytes)) => {
                    file.set_len(0).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                    file.write_all(&bytes).await?;
                    debug!(resource = resource_id, bytes = bytes.len(), "downloaded in one response");
                    break;
                }
                Ok(Chunk::Part { bytes, total }) => {
                    file.write_all(&bytes).await?;
                    offset += bytes.len() as u64;
                    debug!(resource = resource_id, offset, total, "download progress");
                    let done = match total {
                        Some(total) => offset >= total,
                        None => (bytes.len() as u64) < self.config.chunk_size,
                    };
                    if done {
                        break;
                    }
                }
                Ok(Chunk::Exhausted) => break,
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        resource = resource_id,
                        attempt,
                        error = %err,
                        "chunk download failed, retrying remaining range"
                    );
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
                Err(err) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err);
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }

    async fn fetch_chunk(&self, url: &Url, offset: u64) -> Result<Chunk, TransferError> {
        let end = offset + self.config.chunk_size - 1;
        let response = self
            .http
            .get(url.clone())
            .header(header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(content_range_total);
                Ok(Chunk::Part {
                    bytes: response.bytes().await?.to_vec(),
                    total,
                })
            }
            StatusCode::OK => Ok(Chunk::Whole(response.bytes().await?.to_vec())),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Chunk::Exhausted),
            status => Err(TransferError::Api { status }),
        }
    }
}

impl Default for AttachmentDownloader {
    fn default() -> Self {
        Self::new()
    }
}

/// `<resource_id>` plus the extension of the URL path, when it has a sane one.
fn asset_file_name(resource_id: &str, url: &Url) -> String {
    let extension = Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase);
    match extension {
        Some(ext) => format!("{resource_id}.{ext}"),
        None => resource_id.to_string(),
    }
}

// "bytes 0-4/5" -> 5; "bytes 0-4/*" -> None.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.parse().ok()
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_downloader() -> AttachmentDownloader {
        AttachmentDownloader::with_config(DownloaderConfig {
            chunk_size: 4,
            max_retries: 3,
            retry_base: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn downloads_whole_response_into_assets_dir() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/pic.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"imagedata"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let downloader = fast_downloader();
        let target = downloader
            .save(dir.path(), "res1", &format!("{}/files/pic.png", server.uri()))
            .await
            .unwrap();

        assert_eq!(target, dir.path().join("assets/res1.png"));
        assert_eq!(std::fs::read(&target).unwrap(), b"imagedata");
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn assembles_ranged_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/doc.pdf"))
            .and(wiremock::matchers::header("range", "bytes=0-3"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-3/6")
                    .set_body_bytes(b"chun"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/doc.pdf"))
            .and(wiremock::matchers::header("range", "bytes=4-7"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 4-5/6")
                    .set_body_bytes(b"ks"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let downloader = fast_downloader();
        let target = downloader
            .save(dir.path(), "res2", &format!("{}/files/doc.pdf", server.uri()))
            .await
            .unwrap();

        assert_eq!(std::fs::read(target).unwrap(), b"chunks");
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.bin"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/a.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let downloader = fast_downloader();
        let target = downloader
            .save(dir.path(), "res3", &format!("{}/files/a.bin", server.uri()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn permanent_failure_removes_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let downloader = fast_downloader();
        let err = downloader
            .save(dir.path(), "res4", &format!("{}/files/gone.png", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Api { status } if status == 404));
        assert!(!dir.path().join("assets/res4.png").exists());
        assert!(!dir.path().join("assets/res4.png.partial").exists());
    }

    #[test]
    fn derives_filename_from_resource_id_and_url_extension() {
        let url = Url::parse("https://cdn.example/x/photo.JPG?sig=abc").unwrap();
        assert_eq!(asset_file_name("res9", &url), "res9.jpg");
        let bare = Url::parse("https://cdn.example/x/blob").unwrap();
        assert_eq!(asset_file_name("res9", &bare), "res9");
    }

    #[test]
    fn parses_content_range_totals() {
        assert_eq!(content_range_total("bytes 0-4/5"), Some(5));
        assert_eq!(content_range_total("bytes 0-4/*"), None);
    }
}
