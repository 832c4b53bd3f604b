/// Object-store backend: path-style GET of `bucket/key` through the S3 client
use std::time::Duration;

use futures_util::StreamExt;
use s3::bucket::Bucket;
use s3::Region;

use crate::importer::auth::Credentials;
use crate::importer::download_error::DownloadError;
use crate::importer::endpoint::Endpoint;
use crate::importer::error::ImportError;
use crate::importer::stream_utils::BodyStream;

/// Whole-transfer limit for one object GET
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// Client for the bucket named by `endpoint`.
///
/// Requests are SigV4-signed when `credentials` are static and sent
/// unsigned otherwise. `secure` selects HTTPS. Nothing here touches the
/// network.
pub(crate) fn open_bucket(
    endpoint: &Endpoint,
    credentials: &Credentials,
    region: &str,
    secure: bool,
) -> Result<Box<Bucket>, ImportError> {
    let name = endpoint.bucket.as_deref().ok_or_else(|| {
        ImportError::Config(format!("endpoint '{}' does not name a bucket", endpoint))
    })?;
    let region = Region::Custom {
        region: region.to_string(),
        endpoint: endpoint.base_url(secure),
    };

    let bucket = Bucket::new(name, region, credentials.to_s3()?)
        .map_err(|e| ImportError::Config(format!("failed to set up bucket '{}': {}", name, e)))?
        .with_path_style()
        .with_request_timeout(REQUEST_TIMEOUT)
        .map_err(|e| ImportError::Config(format!("failed to set up bucket '{}': {}", name, e)))?;

    tracing::debug!(
        bucket = %name,
        server = %endpoint.base_url(secure),
        anonymous = credentials.is_anonymous(),
        "object-store client ready"
    );
    Ok(bucket)
}

/// Open the object at `key` and hand back its body
pub(crate) async fn get_object(bucket: &Bucket, key: &str) -> Result<BodyStream, ImportError> {
    tracing::info!(key = %key, "requesting object");

    let response = bucket
        .get_object_stream(key)
        .await
        .map_err(DownloadError::from_s3)?;

    tracing::debug!(status = response.status_code, "received object response");
    if !(200..300).contains(&response.status_code) {
        return Err(DownloadError::from_status_code(response.status_code).into());
    }

    Ok(response
        .bytes
        .map(|chunk| chunk.map_err(DownloadError::from_s3))
        .boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint_for(server: &MockServer, bucket_key: &str) -> Endpoint {
        let authority = server.uri().trim_start_matches("http://").to_string();
        Endpoint::parse(&format!("{}/{}", authority, bucket_key)).unwrap()
    }

    async fn read_body(body: BodyStream) -> Vec<u8> {
        let chunks: Vec<_> = body.collect().await;
        chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_bucket_requires_object_store_endpoint() {
        let ep = Endpoint::parse("https://cdn.example.com/disk.img").unwrap();
        assert!(matches!(
            open_bucket(&ep, &Credentials::Anonymous, "us-east-1", true),
            Err(ImportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_signed_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/nested/disk.img"))
            .and(header_exists("x-amz-content-sha256"))
            .and(header_exists("x-amz-date"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let creds = Credentials::new(Some("AKID"), Some("SECRET")).unwrap();
        let ep = endpoint_for(&server, "images/nested/disk.img");
        let bucket = open_bucket(&ep, &creds, "us-east-1", false).unwrap();

        let body = get_object(&bucket, &ep.key).await.unwrap();
        assert_eq!(read_body(body).await, b"raw");

        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKID/"), "{}", auth);
        assert!(auth.contains("/us-east-1/s3/aws4_request"), "{}", auth);
    }

    #[tokio::test]
    async fn test_anonymous_request_is_unsigned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/disk.img"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw".to_vec()))
            .mount(&server)
            .await;

        let ep = endpoint_for(&server, "images/disk.img");
        let bucket = open_bucket(&ep, &Credentials::Anonymous, "us-east-1", false).unwrap();
        read_body(get_object(&bucket, &ep.key).await.unwrap()).await;

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_access_denied_is_connection_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let ep = endpoint_for(&server, "images/disk.img");
        let bucket = open_bucket(&ep, &Credentials::Anonymous, "us-east-1", false).unwrap();
        match get_object(&bucket, &ep.key).await {
            Err(ImportError::Connection(cause)) => assert!(cause.is_auth_rejected()),
            Err(other) => panic!("expected connection error, got {:?}", other),
            Ok(_) => panic!("expected connection error, got a body"),
        }
    }
}
