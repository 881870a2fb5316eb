//! Guarded source ingestion
//!
//! Downloads a source image by URL scheme (`http(s)`, `local`, `s3`,
//! `gs`) into a pooled buffer, enforcing the file-size, type and
//! dimension guards before the pipeline ever sees a byte of pixel
//! data. Response caching headers are captured for forwarding.

pub mod pool;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::Config;
use crate::error::ServiceError;
use crate::meta::{self, ImageMeta, ProbeResult};
use crate::options::ImageType;
use crate::server::deadline::Deadline;
use pool::BufferPool;

/// Longest error body excerpt folded into an unreachable-source message.
const ERROR_BODY_LIMIT: usize = 1024;

/// Source bytes plus their detected type. The backing buffer goes back
/// to the pool exactly once, when the value drops.
#[derive(Debug)]
pub struct ImageData {
    buf: Option<Vec<u8>>,
    pub format: ImageType,
    pool: Arc<BufferPool>,
}

impl ImageData {
    fn new(buf: Vec<u8>, format: ImageType, pool: Arc<BufferPool>) -> Self {
        ImageData {
            buf: Some(buf),
            format,
            pool,
        }
    }

    /// Assembles image data from an already-guarded buffer. Intended
    /// for the watermark loader and tests; request traffic goes
    /// through [`Fetcher::download`].
    pub fn from_parts(buf: Vec<u8>, format: ImageType, pool: Arc<BufferPool>) -> Self {
        ImageData::new(buf, format, pool)
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Drop for ImageData {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// A fully ingested source with its probe result and forwarded headers.
#[derive(Debug)]
pub struct FetchedImage {
    pub data: ImageData,
    pub meta: ImageMeta,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
}

/// Scheme-dispatched downloader. Clients and limits are immutable
/// after startup.
pub struct Fetcher {
    client: reqwest::Client,
    s3: Option<aws_sdk_s3::Client>,
    pool: Arc<BufferPool>,
    local_fs_root: String,
    gcs_key: String,
    max_src_file_size: usize,
    max_src_dimension: u32,
    max_src_resolution: u64,
    max_svg_check_bytes: usize,
}

impl Fetcher {
    pub async fn new(conf: &Config) -> anyhow::Result<Fetcher> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.download_timeout))
            .pool_max_idle_per_host(conf.concurrency)
            .tcp_keepalive(Duration::from_secs(600))
            .user_agent(conf.user_agent.clone());
        if conf.ignore_ssl_verification {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().context("failed to build download client")?;

        let s3 = if conf.s3_enabled {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if !conf.s3_region.is_empty() {
                loader = loader.region(aws_config::Region::new(conf.s3_region.clone()));
            }
            let sdk_config = loader.load().await;
            let mut s3_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
            if !conf.s3_endpoint.is_empty() {
                s3_builder = s3_builder
                    .endpoint_url(conf.s3_endpoint.clone())
                    .force_path_style(true);
            }
            Some(aws_sdk_s3::Client::from_conf(s3_builder.build()))
        } else {
            None
        };

        Ok(Fetcher {
            client,
            s3,
            pool: Arc::new(BufferPool::new(conf.concurrency, conf.download_buffer_size)),
            local_fs_root: conf.local_fs_root.clone(),
            gcs_key: conf.gcs_key.clone(),
            max_src_file_size: conf.max_src_file_size,
            max_src_dimension: conf.max_src_dimension,
            max_src_resolution: conf.max_src_resolution,
            max_svg_check_bytes: conf.max_svg_check_bytes,
        })
    }

    /// Downloads `url`, dispatching on its scheme.
    pub async fn download(
        &self,
        url: &str,
        deadline: Deadline,
    ) -> Result<FetchedImage, ServiceError> {
        deadline.check()?;

        if let Some(rest) = url.strip_prefix("local://") {
            self.fetch_local(rest).await
        } else if let Some(rest) = url.strip_prefix("s3://") {
            self.fetch_s3(rest).await
        } else if let Some(rest) = url.strip_prefix("gs://") {
            let media_url = format!("https://storage.googleapis.com/{}", rest);
            let bearer = (!self.gcs_key.is_empty()).then_some(self.gcs_key.as_str());
            self.fetch_http(&media_url, bearer, deadline).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url, None, deadline).await
        } else {
            Err(ServiceError::invalid_path(format!(
                "unsupported source url scheme: {}",
                url
            )))
        }
    }

    /// Probes and guards bytes that are already in memory (watermark
    /// data, local files, object-store responses).
    pub fn ingest(&self, bytes: Vec<u8>) -> Result<FetchedImage, ServiceError> {
        self.check_file_size(bytes.len())?;

        let mut buf = self.pool.get(bytes.len());
        buf.extend_from_slice(&bytes);
        drop(bytes);

        match self.finish_probe(&buf) {
            Ok(meta) => Ok(FetchedImage {
                data: ImageData::new(buf, meta.format, Arc::clone(&self.pool)),
                meta,
                cache_control: None,
                expires: None,
            }),
            Err(e) => {
                self.pool.put(buf);
                Err(e)
            }
        }
    }

    async fn fetch_http(
        &self,
        url: &str,
        bearer: Option<&str>,
        deadline: Deadline,
    ) -> Result<FetchedImage, ServiceError> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| ServiceError::unreachable(format!("can't download image: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = Vec::new();
            while body.len() < ERROR_BODY_LIMIT {
                match response.chunk().await {
                    Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                    _ => break,
                }
            }
            body.truncate(ERROR_BODY_LIMIT);
            return Err(ServiceError::unreachable(format!(
                "can't download image; status: {}; {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }

        let content_length = response.content_length().unwrap_or(0) as usize;
        self.check_file_size(content_length)?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let cache_control = header("cache-control");
        let expires = header("expires");

        let mut buf = self.pool.get(content_length);
        let mut probed: Option<ImageMeta> = None;

        let result = loop {
            if let Err(e) = deadline.check() {
                break Err(e);
            }

            let chunk = match response.chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    break Err(ServiceError::unreachable(format!(
                        "can't download image: {}",
                        e
                    )));
                }
            };

            match chunk {
                Some(chunk) => {
                    buf.extend_from_slice(&chunk);
                    if self.max_src_file_size > 0 && buf.len() > self.max_src_file_size {
                        break Err(ServiceError::SourceFileTooBig);
                    }
                    if probed.is_none() {
                        match self.probe_step(&buf, false) {
                            Ok(found) => probed = found,
                            Err(e) => break Err(e),
                        }
                    }
                }
                None => {
                    break match probed {
                        Some(meta) => Ok(meta),
                        None => self.finish_probe(&buf),
                    };
                }
            }
        };

        match result {
            Ok(meta) => Ok(FetchedImage {
                data: ImageData::new(buf, meta.format, Arc::clone(&self.pool)),
                meta,
                cache_control,
                expires,
            }),
            Err(e) => {
                self.pool.put(buf);
                Err(e)
            }
        }
    }

    async fn fetch_local(&self, rest: &str) -> Result<FetchedImage, ServiceError> {
        if self.local_fs_root.is_empty() {
            return Err(ServiceError::unreachable(
                "local filesystem root is not configured",
            ));
        }

        let relative = rest.trim_start_matches('/');
        let candidate = Path::new(relative);
        if candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ServiceError::unreachable(format!(
                "forbidden local path: {}",
                rest
            )));
        }

        let full: PathBuf = Path::new(&self.local_fs_root).join(candidate);

        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| ServiceError::unreachable(format!("can't read local file: {}", e)))?;
        self.check_file_size(metadata.len() as usize)?;

        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| ServiceError::unreachable(format!("can't read local file: {}", e)))?;
        self.ingest(bytes)
    }

    async fn fetch_s3(&self, rest: &str) -> Result<FetchedImage, ServiceError> {
        let s3 = self
            .s3
            .as_ref()
            .ok_or_else(|| ServiceError::unreachable("S3 support is not enabled"))?;

        let (bucket, key_and_query) = rest
            .split_once('/')
            .ok_or_else(|| ServiceError::invalid_path(format!("invalid s3 url: {}", rest)))?;
        let (key, version) = match key_and_query.split_once('?') {
            Some((key, query)) => {
                let version = query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("versionId="))
                    .map(str::to_string);
                (key, version)
            }
            None => (key_and_query, None),
        };

        let response = s3
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version)
            .send()
            .await
            .map_err(|e| ServiceError::unreachable(format!("can't download image from S3: {}", e)))?;

        if let Some(length) = response.content_length() {
            self.check_file_size(length.max(0) as usize)?;
        }
        let cache_control = response.cache_control().map(str::to_string);

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ServiceError::unreachable(format!("can't download image from S3: {}", e)))?;

        let mut fetched = self.ingest(body.into_bytes().to_vec())?;
        fetched.cache_control = cache_control;
        Ok(fetched)
    }

    /// Progressive probe over a growing buffer; `None` means more bytes
    /// are needed.
    fn probe_step(&self, buf: &[u8], eof: bool) -> Result<Option<ImageMeta>, ServiceError> {
        match meta::probe(buf, eof, self.max_svg_check_bytes) {
            ProbeResult::Found(found) => {
                self.check_meta(&found)?;
                Ok(Some(found))
            }
            ProbeResult::NeedMore => Ok(None),
            ProbeResult::Unsupported => Err(ServiceError::SourceTypeUnsupported),
        }
    }

    /// Final probe over a complete buffer.
    fn finish_probe(&self, buf: &[u8]) -> Result<ImageMeta, ServiceError> {
        self.probe_step(buf, true)?
            .ok_or(ServiceError::SourceTypeUnsupported)
    }

    fn check_meta(&self, found: &ImageMeta) -> Result<(), ServiceError> {
        if !found.format.supports_load() && found.format != ImageType::Svg {
            return Err(ServiceError::SourceTypeUnsupported);
        }
        self.check_dimensions(found.width, found.height)
    }

    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<(), ServiceError> {
        if self.max_src_dimension > 0
            && (width > self.max_src_dimension || height > self.max_src_dimension)
        {
            return Err(ServiceError::SourceDimensionsTooBig);
        }
        if u64::from(width) * u64::from(height) > self.max_src_resolution {
            return Err(ServiceError::SourceResolutionTooBig);
        }
        Ok(())
    }

    fn check_file_size(&self, size: usize) -> Result<(), ServiceError> {
        if self.max_src_file_size > 0 && size > self.max_src_file_size {
            return Err(ServiceError::SourceFileTooBig);
        }
        Ok(())
    }
}
