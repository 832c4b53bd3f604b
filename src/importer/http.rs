use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;

use crate::importer::download_error::DownloadError;
use crate::importer::error::ImportError;
use crate::importer::options::HttpClientOptions;
use crate::importer::stream_utils::BodyStream;

const USER_AGENT: &str = concat!("importer/", env!("CARGO_PKG_VERSION"));

pub(crate) fn setup_http_client(options: &HttpClientOptions) -> Result<Client, ImportError> {
    tracing::debug!(
        tls = "rustls",
        keepalive_secs = 10,
        connect_timeout_secs = 30,
        "initializing HTTP client"
    );

    let mut builder = Client::builder()
        .use_rustls_tls()
        .http2_adaptive_window(true)
        .http2_initial_stream_window_size(Some(1024 * 1024 * 16))
        .http2_initial_connection_window_size(Some(1024 * 1024 * 32))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        // Keep long transfers from being dropped by idle middleboxes
        .tcp_keepalive(Some(Duration::from_secs(10)))
        .tcp_nodelay(true)
        .timeout(Duration::from_secs(2 * 3600))
        .connect_timeout(Duration::from_secs(30));

    if let Some(ca_cert_path) = &options.cacert {
        tracing::info!(path = %ca_cert_path.display(), "loading CA certificate");
        let cert_bytes = std::fs::read(ca_cert_path).map_err(|e| {
            ImportError::Config(format!(
                "failed to read CA certificate {}: {}",
                ca_cert_path.display(),
                e
            ))
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_bytes)
            .map_err(|e| ImportError::Config(format!("failed to parse CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }

    if options.insecure_tls {
        tracing::warn!("certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| ImportError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Issue a GET and hand back the response once its status is known good.
///
/// `Accept-Encoding: identity` keeps transport compression from hiding the
/// object's own encoding.
pub(crate) async fn start_download(
    client: &Client,
    url: &str,
    headers: &[(String, String)],
    basic_auth: Option<(&str, &str)>,
) -> Result<reqwest::Response, DownloadError> {
    tracing::info!(url = %url, "starting download");

    let mut request = client
        .get(url)
        .header("User-Agent", USER_AGENT)
        .header("Accept", "*/*")
        .header("Accept-Encoding", "identity");

    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some((username, password)) = basic_auth {
        request = request.basic_auth(username, Some(password));
    }

    tracing::debug!(
        method = "GET",
        url = %url,
        extra_headers = headers.len(),
        authenticated = basic_auth.is_some(),
        "sending request"
    );

    let response = request.send().await.map_err(DownloadError::from_reqwest)?;

    tracing::debug!(
        status = response.status().as_u16(),
        version = ?response.version(),
        content_length = ?response.content_length(),
        remote_addr = ?response.remote_addr(),
        "received response"
    );

    if !response.status().is_success() {
        return Err(DownloadError::from_http_response(&response));
    }

    Ok(response)
}

/// Body of a successful response as classified chunks
pub(crate) fn body_stream(response: reqwest::Response) -> BodyStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(DownloadError::from_reqwest))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let options = HttpClientOptions {
            insecure_tls: false,
            cacert: Some("/nonexistent/ca.pem".into()),
        };
        assert!(matches!(
            setup_http_client(&options),
            Err(ImportError::Config(msg)) if msg.contains("CA certificate")
        ));
    }

    #[tokio::test]
    async fn test_start_download_sends_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/disk.img"))
            .and(header("Accept-Encoding", "identity"))
            .and(header("X-Token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let client = setup_http_client(&HttpClientOptions::default()).unwrap();
        let headers = vec![("X-Token".to_string(), "abc".to_string())];
        let response = start_download(
            &client,
            &format!("{}/disk.img", server.uri()),
            &headers,
            None,
        )
        .await
        .unwrap();

        let chunks: Vec<_> = body_stream(response).collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"data");
    }

    #[tokio::test]
    async fn test_start_download_classifies_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.img"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = setup_http_client(&HttpClientOptions::default()).unwrap();
        let err = start_download(
            &client,
            &format!("{}/missing.img", server.uri()),
            &[],
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::HttpClientError(404, _)));
    }
}
