//! Request orchestrator
//!
//! Owns the HTTP surface and the per-request lifecycle: CORS and
//! method handling, bearer-secret and signature checks, admission
//! under the concurrency semaphore, the write deadline, fetch →
//! pipeline hand-off onto a blocking thread, response encoding and
//! error mapping.

pub mod deadline;
pub mod etag;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use flate2::write::GzEncoder;
use tokio::sync::Semaphore;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::config::Config;
use crate::error::ServiceError;
use crate::fetch::Fetcher;
use crate::options::{parse_path, split_signature, ParsedRequest};
use crate::options::parse::ParseContext;
use crate::pipeline::{self, PipelineContext, ProcessedImage};
use crate::signature::{constant_time_eq, Signer};
use crate::watermark::Watermark;
use deadline::Deadline;

/// Process-wide request state, immutable after startup.
pub struct AppState {
    pub config: Config,
    pub signer: Signer,
    pub fetcher: Fetcher,
    pub watermark: Option<Watermark>,
    /// Gates entry to the fetch+transform stage.
    semaphore: Semaphore,
}

impl AppState {
    pub fn new(config: Config, fetcher: Fetcher, watermark: Option<Watermark>) -> AppState {
        let signer = Signer::new(
            config.keys.clone(),
            config.salts.clone(),
            config.signature_size,
        );
        let semaphore = Semaphore::new(config.concurrency);
        AppState {
            config,
            signer,
            fetcher,
            watermark,
            semaphore,
        }
    }
}

/// Builds the service router. The listener-level client cap is a
/// global concurrency limit shared by every connection.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_clients = state.config.max_clients;
    Router::new()
        .route("/health", get(health))
        .route("/favicon.ico", get(favicon))
        .fallback(handle_request)
        .layer(GlobalConcurrencyLimitLayer::new(max_clients))
        .with_state(state)
}

/// Binds and serves until SIGINT/SIGTERM.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, concurrency = state.config.concurrency, "starting server");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down the server");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

async fn health() -> &'static str {
    "imgproxy is running"
}

async fn favicon() -> StatusCode {
    StatusCode::OK
}

async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let started = Instant::now();

    tracing::info!(
        id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
        "request"
    );

    if request.method() == Method::OPTIONS {
        return cors_response(&state.config, StatusCode::OK, Body::empty());
    }

    let result = process_request(&state, &request).await;

    match result {
        Ok(responded) => {
            tracing::info!(
                id = %request_id,
                status = responded.status().as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                "processed"
            );
            responded
        }
        Err(err) => {
            if err.is_unexpected() {
                tracing::error!(id = %request_id, error = %err.internal_message(), "request failed");
            } else {
                tracing::warn!(id = %request_id, error = %err.internal_message(), "request rejected");
            }
            error_response(&state.config, &err)
        }
    }
}

async fn process_request(
    state: &Arc<AppState>,
    request: &Request,
) -> Result<Response, ServiceError> {
    let config = &state.config;

    if request.method() != Method::GET {
        return Err(ServiceError::InvalidMethod {
            method: request.method().to_string(),
        });
    }

    check_secret(config, request.headers())?;

    let path = request.uri().path().to_string();
    let (signature, signed_path) = split_signature(&path)?;
    state.signer.verify(signature, signed_path)?;

    let parse_ctx = ParseContext {
        presets: &config.presets,
        default_quality: config.quality,
        max_src_resolution: config.max_src_resolution,
        base_url: (!config.base_url.is_empty()).then_some(config.base_url.as_str()),
    };
    let ParsedRequest {
        source_url,
        mut options,
    } = parse_path(signed_path, &parse_ctx)?;

    apply_negotiation(config, request.headers(), &mut options);

    let deadline = Deadline::after(Duration::from_secs(config.write_timeout));

    // Admission: wait for a transform slot, but never past the deadline.
    let _permit = tokio::time::timeout(deadline.remaining(), state.semaphore.acquire())
        .await
        .map_err(|_| ServiceError::Timeout)?
        .map_err(|_| ServiceError::processing("admission semaphore closed"))?;

    let fetched = state.fetcher.download(&source_url, deadline).await?;
    deadline.check()?;

    let etag = config
        .etag_enabled
        .then(|| etag::calc_etag(fetched.data.bytes(), &options));
    if let Some(etag) = &etag {
        let matches = request
            .headers()
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| constant_time_eq(v.as_bytes(), etag.as_bytes()))
            .unwrap_or(false);
        if matches {
            return Ok(not_modified_response(config, etag));
        }
    }

    let cache_control = fetched.cache_control.clone();
    let expires = fetched.expires.clone();

    // The CPU-bound pipeline is pinned to one OS thread for the whole
    // request; panics surface as ProcessingFailed.
    let blocking_state = Arc::clone(state);
    let processed = tokio::task::spawn_blocking(move || {
        let ctx = PipelineContext {
            jpeg_progressive: blocking_state.config.jpeg_progressive,
            png_interlaced: blocking_state.config.png_interlaced,
            use_linear_colorspace: blocking_state.config.use_linear_colorspace,
            max_animation_frames: blocking_state.config.max_animation_frames,
            max_src_resolution: blocking_state.config.max_src_resolution,
            max_src_dimension: blocking_state.config.max_src_dimension,
            watermark: blocking_state.watermark.as_ref(),
        };
        pipeline::process_image(&fetched.data, &fetched.meta, &options, &ctx, deadline)
    })
    .await
    .map_err(|e| {
        if e.is_panic() {
            ServiceError::processing("image processing panicked")
        } else {
            ServiceError::processing(format!("image processing was aborted: {}", e))
        }
    })??;

    deadline.check()?;

    Ok(image_response(
        config,
        request.headers(),
        processed,
        cache_control,
        expires,
        etag,
    ))
}

/// Bearer secret check; constant time over the token.
fn check_secret(config: &Config, headers: &HeaderMap) -> Result<(), ServiceError> {
    if config.secret.is_empty() {
        return Ok(());
    }
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| constant_time_eq(token.as_bytes(), config.secret.as_bytes()))
        .unwrap_or(false);
    if authorized {
        Ok(())
    } else {
        Err(ServiceError::InvalidSecret)
    }
}

/// WebP negotiation from the Accept header and Client Hints.
fn apply_negotiation(
    config: &Config,
    headers: &HeaderMap,
    options: &mut crate::options::ProcessingOptions,
) {
    let accepts_webp = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("image/webp"))
        .unwrap_or(false);
    options.prefer_webp = accepts_webp && config.enable_webp_detection;
    options.enforce_webp = accepts_webp && config.enforce_webp;

    if config.enable_client_hints {
        if options.width == 0 {
            if let Some(width) = headers
                .get("width")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u32>().ok())
            {
                options.width = width;
            }
        }
        if let Some(dpr) = headers
            .get("dpr")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
        {
            if dpr > 0.0 {
                options.dpr = dpr;
            }
        }
    }
}

fn http_date(time: chrono::DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn apply_cors(config: &Config, response: &mut Response) {
    if config.allow_origin.is_empty() {
        return;
    }
    let headers = response.headers_mut();
    if let Ok(origin) = HeaderValue::from_str(&config.allow_origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
}

fn cors_response(config: &Config, status: StatusCode, body: Body) -> Response {
    let mut response = Response::builder()
        .status(status)
        .body(body)
        .expect("static response");
    apply_cors(config, &mut response);
    response
}

fn error_response(config: &Config, err: &ServiceError) -> Response {
    let body = if config.development_errors {
        err.internal_message()
    } else {
        err.public_message().to_string()
    };
    let mut response = Response::builder()
        .status(StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .expect("static response");
    apply_cors(config, &mut response);
    response
}

fn not_modified_response(config: &Config, etag: &str) -> Response {
    let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
    if let Ok(value) = HeaderValue::from_str(etag) {
        builder = builder.header(header::ETAG, value);
    }
    let mut response = builder.body(Body::empty()).expect("static response");
    apply_cors(config, &mut response);
    response
}

fn image_response(
    config: &Config,
    request_headers: &HeaderMap,
    processed: ProcessedImage,
    source_cache_control: Option<String>,
    source_expires: Option<String>,
    etag: Option<String>,
) -> Response {
    let gzipped = config.gzip_compression > 0
        && request_headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

    // Source caching headers are forwarded when present; the
    // configured TTL is the fallback.
    let cache_control = source_cache_control
        .unwrap_or_else(|| format!("max-age={}, public", config.ttl));
    let expires = source_expires.unwrap_or_else(|| {
        http_date(Utc::now() + chrono::Duration::seconds(config.ttl as i64))
    });

    let body = if gzipped {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(processed.data.len() / 2),
            flate2::Compression::new(config.gzip_compression),
        );
        // Infallible for Vec writers.
        encoder.write_all(&processed.data).expect("gzip into memory");
        encoder.finish().expect("gzip into memory")
    } else {
        processed.data
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, processed.format.mime())
        .header(header::CONTENT_LENGTH, body.len())
        .header(header::CACHE_CONTROL, cache_control)
        .header(header::EXPIRES, expires);
    if gzipped {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
    }
    if let Some(etag) = etag {
        if let Ok(value) = HeaderValue::from_str(&etag) {
            builder = builder.header(header::ETAG, value);
        }
    }

    let mut response = builder.body(Body::from(body)).expect("image response");
    apply_cors(config, &mut response);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_secret_disabled() {
        let config = Config::default();
        assert!(check_secret(&config, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_check_secret_requires_bearer() {
        let mut config = Config::default();
        config.secret = "s3cr3t".to_string();

        let mut headers = HeaderMap::new();
        assert_eq!(
            check_secret(&config, &headers),
            Err(ServiceError::InvalidSecret)
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("s3cr3t"));
        assert_eq!(
            check_secret(&config, &headers),
            Err(ServiceError::InvalidSecret)
        );

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s3cr3t"),
        );
        assert!(check_secret(&config, &headers).is_ok());
    }

    #[test]
    fn test_apply_negotiation_webp() {
        let mut config = Config::default();
        config.enable_webp_detection = true;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("image/webp,image/*"),
        );

        let mut options = crate::options::ProcessingOptions::new(80);
        apply_negotiation(&config, &headers, &mut options);
        assert!(options.prefer_webp);
        assert!(!options.enforce_webp);

        config.enforce_webp = true;
        apply_negotiation(&config, &headers, &mut options);
        assert!(options.enforce_webp);
    }

    #[test]
    fn test_apply_negotiation_client_hints() {
        let mut config = Config::default();
        config.enable_client_hints = true;

        let mut headers = HeaderMap::new();
        headers.insert("width", HeaderValue::from_static("640"));
        headers.insert("dpr", HeaderValue::from_static("2"));

        let mut options = crate::options::ProcessingOptions::new(80);
        apply_negotiation(&config, &headers, &mut options);
        assert_eq!(options.width, 640);
        assert_eq!(options.dpr, 2.0);

        // An explicit width wins over the hint.
        let mut options = crate::options::ProcessingOptions::new(80);
        options.width = 100;
        apply_negotiation(&config, &headers, &mut options);
        assert_eq!(options.width, 100);
    }

    #[test]
    fn test_http_date_format() {
        let time = chrono::DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(http_date(time), "Thu, 02 Jan 2020 03:04:05 GMT");
    }
}
