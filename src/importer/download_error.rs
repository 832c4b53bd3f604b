//! Backend failure classification
//!
//! Every way a GET against an HTTP server or object store can fail is
//! folded into one of these variants, so the caller can tell rejected
//! credentials from a missing object or a dead network.

use std::error::Error as StdError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    /// 4xx other than 429; 401 and 403 mean the credentials were refused
    #[error("backend returned {0} {1}")]
    HttpClientError(u16, String),

    #[error("backend returned {0} {1}")]
    HttpServerError(u16, String),

    /// 429, with the Retry-After hint in seconds when the backend sent one
    #[error("backend is throttling requests (429){}", retry_hint(.0))]
    HttpRateLimited(Option<u64>),

    #[error("TLS handshake failed, check --cacert or use -k: {0}")]
    TlsError(String),

    #[error("cannot resolve backend host: {0}")]
    DnsError(String),

    #[error("cannot connect to backend: {0}")]
    ConnectionError(String),

    #[error("backend timed out: {0}")]
    TimeoutError(String),

    #[error("{0}")]
    Other(String),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    retry_after
        .map(|secs| format!(", retry after {}s", secs))
        .unwrap_or_default()
}

/// Reason phrase with a hint at what it usually means for an object GET
fn status_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized (credentials missing or invalid)",
        403 => "Forbidden (access denied for these credentials)",
        404 => "Not Found (no such bucket or object)",
        405 => "Method Not Allowed",
        410 => "Gone",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unexpected Status",
    }
}

/// Lower-cased messages of `error` and every error beneath it
fn chain_messages(error: &(dyn StdError + 'static)) -> Vec<String> {
    std::iter::successors(Some(error), |e: &&(dyn StdError + 'static)| (*e).source())
        .map(|e| e.to_string().to_lowercase())
        .collect()
}

/// Classify a transport failure that reached us type-erased
fn classify_transport(chain: &[String], message: String) -> DownloadError {
    let mentions = |needles: &[&str]| {
        chain
            .iter()
            .any(|text| needles.iter().any(|needle| text.contains(needle)))
    };

    if mentions(&["certificate", "tls", "ssl"]) {
        DownloadError::TlsError(message)
    } else if mentions(&["dns", "failed to lookup address", "name or service not known"]) {
        DownloadError::DnsError(message)
    } else if mentions(&["timed out", "timeout"]) {
        DownloadError::TimeoutError(message)
    } else if mentions(&["connect", "connection refused", "connection reset"]) {
        DownloadError::ConnectionError(message)
    } else {
        DownloadError::Other(message)
    }
}

impl DownloadError {
    pub fn from_http_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => DownloadError::HttpRateLimited(None),
            code @ 400..=499 => DownloadError::HttpClientError(code, status_reason(code).to_string()),
            code => DownloadError::HttpServerError(code, status_reason(code).to_string()),
        }
    }

    pub fn from_status_code(code: u16) -> Self {
        match reqwest::StatusCode::from_u16(code) {
            Ok(status) => Self::from_http_status(status),
            Err(_) => DownloadError::Other(format!("backend returned invalid status {}", code)),
        }
    }

    /// Classify a non-success response, picking up Retry-After on 429
    pub fn from_http_response(response: &reqwest::Response) -> Self {
        match Self::from_http_status(response.status()) {
            DownloadError::HttpRateLimited(_) => DownloadError::HttpRateLimited(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse().ok()),
            ),
            other => other,
        }
    }

    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::from_http_status(status);
        }

        let message = error.to_string();
        if error.is_timeout() {
            return DownloadError::TimeoutError(message);
        }
        if !error.is_connect() {
            return DownloadError::Other(message);
        }

        // rustls and resolver errors reach us type-erased; look at the text
        // of every error in the chain.
        match classify_transport(&chain_messages(&error), message) {
            DownloadError::Other(message) => DownloadError::ConnectionError(message),
            classified => classified,
        }
    }

    /// Classify a failure reported by the object-store client
    pub fn from_s3(error: s3::error::S3Error) -> Self {
        if let s3::error::S3Error::HttpFailWithBody(code, _) = &error {
            return Self::from_status_code(*code);
        }
        classify_transport(&chain_messages(&error), error.to_string())
    }

    /// Whether the backend refused our credentials
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, DownloadError::HttpClientError(401 | 403, _))
    }
}
