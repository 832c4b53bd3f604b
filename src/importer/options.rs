use std::path::PathBuf;

use crate::importer::transform::MAX_CHAIN_DEPTH;

/// Options for one import
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Source location, see `Endpoint`
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Object-store transport: HTTPS when true, plain HTTP otherwise
    pub secure: bool,
    /// Signing region for object-store requests
    pub region: String,
    pub http: HttpClientOptions,
    /// Extra request headers for HTTP sources
    pub headers: Vec<(String, String)>,
    pub buffer_size_mb: usize,
    pub max_chain_depth: usize,
    pub progress_interval_secs: f64,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: None,
            secret_key: None,
            secure: true,
            region: "us-east-1".to_string(),
            http: HttpClientOptions::default(),
            headers: Vec::new(),
            buffer_size_mb: 128,
            max_chain_depth: MAX_CHAIN_DEPTH,
            progress_interval_secs: 0.5,
        }
    }
}

impl ImportOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub(crate) fn buffer_bytes(&self) -> usize {
        self.buffer_size_mb.max(1).saturating_mul(1024 * 1024)
    }
}

/// TLS trust settings for the shared HTTP client
#[derive(Debug, Clone, Default)]
pub struct HttpClientOptions {
    pub insecure_tls: bool,
    pub cacert: Option<PathBuf>,
}

impl From<&ImportOptions> for HttpClientOptions {
    fn from(opts: &ImportOptions) -> Self {
        opts.http.clone()
    }
}
