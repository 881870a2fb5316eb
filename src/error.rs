//! Central error type for the proxy
//!
//! Every failure the request path can produce maps to one variant
//! carrying an HTTP status, a user-facing public message and an internal
//! detailed message. Variants flagged as unexpected are the ones worth
//! reporting to an external error tracker.

use std::fmt;

/// Errors produced anywhere on the request-to-bytes path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Malformed URL grammar, unknown option, bad base64, bad preset.
    InvalidPath { message: String },
    /// HMAC signature mismatch.
    InvalidSignature,
    /// Any method other than GET (OPTIONS is answered before this check).
    InvalidMethod { method: String },
    /// Bearer secret missing or wrong.
    InvalidSecret,
    /// Network/filesystem/object-store failure or non-2xx source status.
    SourceImageUnreachable { message: String },
    /// Probe recognized no supported format.
    SourceTypeUnsupported,
    /// One source axis exceeds the configured maximum.
    SourceDimensionsTooBig,
    /// Source width*height exceeds the resolution budget.
    SourceResolutionTooBig,
    /// Source byte size exceeds the file-size budget.
    SourceFileTooBig,
    /// The imaging backend failed mid-pipeline.
    ProcessingFailed { message: String },
    /// The per-request deadline expired at a checkpoint.
    Timeout,
    /// A raster source was asked to become SVG.
    SvgConversionUnsupported,
    /// Control flow for ETag revalidation, not a real error.
    NotModified,
}

impl ServiceError {
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::InvalidPath { .. } => 404,
            ServiceError::InvalidSignature => 403,
            ServiceError::InvalidMethod { .. } => 405,
            ServiceError::InvalidSecret => 403,
            ServiceError::SourceImageUnreachable { .. } => 404,
            ServiceError::SourceTypeUnsupported
            | ServiceError::SourceDimensionsTooBig
            | ServiceError::SourceResolutionTooBig
            | ServiceError::SourceFileTooBig
            | ServiceError::SvgConversionUnsupported => 422,
            ServiceError::ProcessingFailed { .. } => 500,
            ServiceError::Timeout => 504,
            ServiceError::NotModified => 304,
        }
    }

    /// Message safe to return to the client in production.
    pub fn public_message(&self) -> &'static str {
        match self {
            ServiceError::InvalidPath { .. } => "Invalid image url",
            ServiceError::InvalidSignature | ServiceError::InvalidSecret => "Forbidden",
            ServiceError::InvalidMethod { .. } => "Method not allowed",
            ServiceError::SourceImageUnreachable { .. } => "Source image is unreachable",
            ServiceError::SourceTypeUnsupported
            | ServiceError::SourceDimensionsTooBig
            | ServiceError::SourceResolutionTooBig
            | ServiceError::SourceFileTooBig
            | ServiceError::SvgConversionUnsupported => "Invalid source image",
            ServiceError::ProcessingFailed { .. } => "Error occurred while processing image",
            ServiceError::Timeout => "Timeout while processing image",
            ServiceError::NotModified => "Not modified",
        }
    }

    /// Detailed message for logs and development-mode responses.
    pub fn internal_message(&self) -> String {
        match self {
            ServiceError::InvalidPath { message } => format!("Invalid path: {}", message),
            ServiceError::InvalidSignature => "Invalid signature".to_string(),
            ServiceError::InvalidMethod { method } => format!("Invalid method: {}", method),
            ServiceError::InvalidSecret => "Invalid secret".to_string(),
            ServiceError::SourceImageUnreachable { message } => message.clone(),
            ServiceError::SourceTypeUnsupported => "Source image type not supported".to_string(),
            ServiceError::SourceDimensionsTooBig => {
                "Source image dimensions are too big".to_string()
            }
            ServiceError::SourceResolutionTooBig => {
                "Source image resolution is too big".to_string()
            }
            ServiceError::SourceFileTooBig => "Source image file is too big".to_string(),
            ServiceError::ProcessingFailed { message } => message.clone(),
            ServiceError::Timeout => "Processing deadline expired".to_string(),
            ServiceError::SvgConversionUnsupported => {
                "Conversion to SVG is not supported".to_string()
            }
            ServiceError::NotModified => "Not modified".to_string(),
        }
    }

    /// Whether this failure should be reported to external telemetry.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, ServiceError::ProcessingFailed { .. })
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        ServiceError::InvalidPath {
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        ServiceError::SourceImageUnreachable {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        ServiceError::ProcessingFailed {
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.internal_message())
    }
}

impl std::error::Error for ServiceError {}
