//! Where finished stills go: remote upload, the local "latest" image and the
//! dated archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::runtime::Handle;

use crate::camera::FrameMetadata;
use crate::config::UploadConfig;
use crate::day_period::DayPeriod;

/// Everything known about a finished still.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub device_id: String,
    pub period: DayPeriod,
    pub captured_at: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_index: Option<usize>,
    pub metadata: FrameMetadata,
}

impl ImageInfo {
    /// File stem used for uploads and the archive.
    pub fn stem(&self) -> String {
        self.captured_at.format("%Y%m%d-%H%M%S").to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upload rejected with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no async runtime available for upload")]
    NoRuntime,
}

/// Remote destination for finished stills.
pub trait Uploader: Send + Sync {
    fn upload(&self, jpeg: &[u8], info: &ImageInfo) -> Result<(), UploadError>;
}

/// Upload disabled.
pub struct NoUpload;

impl Uploader for NoUpload {
    fn upload(&self, _jpeg: &[u8], _info: &ImageInfo) -> Result<(), UploadError> {
        Ok(())
    }
}

/// `PUT <url>/<stem>.jpg` with optional basic auth.
pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
    handle: Option<Handle>,
}

impl HttpUploader {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            handle: Handle::try_current().ok(),
        }
    }

    pub fn target_url(&self, info: &ImageInfo) -> String {
        format!("{}/{}.jpg", self.url, info.stem())
    }

    /// Async form of [`Uploader::upload`].
    pub async fn put(&self, jpeg: Vec<u8>, info: &ImageInfo) -> Result<(), UploadError> {
        let url = self.target_url(info);
        log::info!("Uploading {} bytes to {}", jpeg.len(), url);

        let mut request = self
            .client
            .put(&url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }
        log::info!("Upload finished ({})", status);
        Ok(())
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, jpeg: &[u8], info: &ImageInfo) -> Result<(), UploadError> {
        let handle = self.handle.clone().ok_or(UploadError::NoRuntime)?;
        handle.block_on(self.put(jpeg.to_vec(), info))
    }
}

/// Build the uploader described by `config`.
pub fn uploader_from_config(config: &UploadConfig) -> Box<dyn Uploader> {
    if config.enabled {
        Box::new(HttpUploader::new(config))
    } else {
        Box::new(NoUpload)
    }
}

/// Local storage of finished stills.
pub trait ImageSink: Send + Sync {
    /// Overwrite the "latest" image.
    fn save_latest(&self, jpeg: &[u8]) -> std::io::Result<()>;
    /// Keep a dated copy plus its metadata.
    fn archive(&self, jpeg: &[u8], info: &ImageInfo) -> std::io::Result<PathBuf>;
}

pub struct DiskSink {
    latest: PathBuf,
    archive_dir: PathBuf,
}

impl DiskSink {
    pub fn new(latest: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            latest: latest.into(),
            archive_dir: archive_dir.into(),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

impl ImageSink for DiskSink {
    fn save_latest(&self, jpeg: &[u8]) -> std::io::Result<()> {
        write_atomic(&self.latest, jpeg)
    }

    fn archive(&self, jpeg: &[u8], info: &ImageInfo) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.archive_dir)?;
        let stem = info.stem();
        let image_path = self.archive_dir.join(format!("{}.jpg", stem));
        std::fs::write(&image_path, jpeg)?;
        let json = serde_json::to_vec_pretty(info).map_err(std::io::Error::other)?;
        std::fs::write(self.archive_dir.join(format!("{}.json", stem)), json)?;
        Ok(image_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn info() -> ImageInfo {
        ImageInfo {
            device_id: "cam".to_string(),
            period: DayPeriod::Night,
            captured_at: Local.with_ymd_and_hms(2024, 3, 9, 22, 15, 0).unwrap(),
            exposure_index: Some(7),
            metadata: FrameMetadata {
                exposure_time_us: Some(6_000_000),
                ..FrameMetadata::default()
            },
        }
    }

    #[test]
    fn test_stem() {
        assert_eq!(info().stem(), "20240309-221500");
    }

    #[test]
    fn test_disk_sink_latest_and_archive() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::new(dir.path().join("out/latest.jpg"), dir.path().join("images"));
        sink.save_latest(b"one").unwrap();
        sink.save_latest(b"two").unwrap();
        assert_eq!(std::fs::read(dir.path().join("out/latest.jpg")).unwrap(), b"two");

        let archived = sink.archive(b"jpeg", &info()).unwrap();
        assert_eq!(archived, dir.path().join("images/20240309-221500.jpg"));
        let meta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("images/20240309-221500.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["period"], "night");
        assert_eq!(meta["exposure_index"], 7);
        assert_eq!(meta["metadata"]["exposure_time_us"], 6_000_000);
    }

    fn upload_config(url: String) -> UploadConfig {
        UploadConfig {
            enabled: true,
            url,
            username: Some("cam".to_string()),
            password: Some("secret".to_string()),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_http_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload/20240309-221500.jpg"))
            .and(header("content-type", "image/jpeg"))
            .and(header("authorization", "Basic Y2FtOnNlY3JldA=="))
            .and(body_bytes(b"jpeg".to_vec()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = HttpUploader::new(&upload_config(format!("{}/upload/", server.uri())));
        uploader.put(b"jpeg".to_vec(), &info()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_put_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("nope"))
            .mount(&server)
            .await;

        let uploader = HttpUploader::new(&upload_config(server.uri()));
        let err = uploader.put(b"jpeg".to_vec(), &info()).await.unwrap_err();
        assert!(matches!(err, UploadError::Status { status: 403, ref body } if body == "nope"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_upload_from_worker_thread() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = HttpUploader::new(&upload_config(server.uri()));
        tokio::task::spawn_blocking(move || uploader.upload(b"jpeg", &info()))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_upload_without_runtime_fails() {
        let uploader = HttpUploader::new(&upload_config("http://127.0.0.1:9".to_string()));
        assert!(matches!(
            uploader.upload(b"jpeg", &info()),
            Err(UploadError::NoRuntime)
        ));
    }
}
