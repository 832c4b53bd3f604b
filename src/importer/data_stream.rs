//! Data Stream Factory
//!
//! Turns an endpoint plus credentials into one fully decoded, validated
//! byte stream. Everything that can be checked without the network
//! (endpoint syntax, credential pairing, the declared file name, option
//! ranges) is checked when the factory is built.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use s3::bucket::Bucket;

use crate::importer::auth::Credentials;
use crate::importer::endpoint::{Endpoint, Scheme};
use crate::importer::error::ImportError;
use crate::importer::http::{body_stream, setup_http_client, start_download};
use crate::importer::object_store::{get_object, open_bucket};
use crate::importer::options::{HttpClientOptions, ImportOptions};
use crate::importer::peek::PeekReader;
use crate::importer::stream_utils::DownloadSource;
use crate::importer::transform::{build_chain_with_depth, Stage, StageKind, TransformChain};
use crate::importer::validation::{declared_format, strip_outer_suffix, ImageFormat};

/// Longest accepted progress interval, one day
const MAX_PROGRESS_INTERVAL_SECS: f64 = 86_400.0;

enum Backend {
    Http(Client),
    ObjectStore(Box<Bucket>),
}

pub struct DataStreamFactory {
    endpoint: Endpoint,
    credentials: Credentials,
    declared: ImageFormat,
    options: ImportOptions,
    backend: Backend,
}

impl DataStreamFactory {
    /// Factory with default options for `endpoint` and an optional key pair
    pub fn new(
        endpoint: &str,
        access_key: Option<&str>,
        secret_key: Option<&str>,
    ) -> Result<Self, ImportError> {
        Self::from_options(ImportOptions {
            endpoint: endpoint.to_string(),
            access_key: access_key.map(str::to_string),
            secret_key: secret_key.map(str::to_string),
            ..ImportOptions::default()
        })
    }

    pub fn from_options(options: ImportOptions) -> Result<Self, ImportError> {
        let endpoint = Endpoint::parse(&options.endpoint)?;
        let credentials = Credentials::new(
            options.access_key.as_deref(),
            options.secret_key.as_deref(),
        )?;

        let name = endpoint.base_name();
        let declared = declared_format(name)
            .ok_or_else(|| ImportError::InvalidFormat(name.to_string()))?;

        let interval = options.progress_interval_secs;
        if !(0.0..=MAX_PROGRESS_INTERVAL_SECS).contains(&interval) {
            return Err(ImportError::Config(format!(
                "progress interval must be between 0 and {} seconds, got {}",
                MAX_PROGRESS_INTERVAL_SECS, interval
            )));
        }
        if options.region.trim().is_empty() {
            return Err(ImportError::Config("signing region is empty".to_string()));
        }

        let backend = match endpoint.scheme {
            Scheme::ObjectStore => {
                if options.http.insecure_tls || options.http.cacert.is_some() {
                    return Err(ImportError::Config(
                        "custom TLS trust settings apply to http(s) endpoints only".to_string(),
                    ));
                }
                Backend::ObjectStore(open_bucket(
                    &endpoint,
                    &credentials,
                    options.region.trim(),
                    options.secure,
                )?)
            }
            Scheme::Http | Scheme::Https => {
                Backend::Http(setup_http_client(&HttpClientOptions::from(&options))?)
            }
        };

        tracing::debug!(
            endpoint = %endpoint,
            declared = %declared,
            anonymous = credentials.is_anonymous(),
            "data stream factory ready"
        );

        Ok(Self {
            endpoint,
            credentials,
            declared,
            options,
            backend,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Terminal format declared by the endpoint's file name
    pub fn declared_format(&self) -> ImageFormat {
        self.declared
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub(crate) fn progress_interval(&self) -> Duration {
        Duration::from_secs_f64(self.options.progress_interval_secs)
    }

    /// Open the backend, build the decode chain over it and validate the
    /// decoded header.
    ///
    /// Nothing is retried. On failure every resource opened so far is
    /// released before the error is returned.
    pub async fn new_data_stream(&self) -> Result<DataStream, ImportError> {
        let (body, content_length) = match &self.backend {
            Backend::ObjectStore(bucket) => (get_object(bucket, &self.endpoint.key).await?, None),
            Backend::Http(client) => {
                let response = start_download(
                    client,
                    &self.endpoint.url(self.options.secure),
                    &self.options.headers,
                    self.credentials.basic_auth(),
                )
                .await?;
                let content_length = response.content_length();
                (body_stream(response), content_length)
            }
        };

        match content_length {
            Some(len) => tracing::info!(
                "Content length: {} bytes ({:.2} MB)",
                len,
                len as f64 / (1024.0 * 1024.0)
            ),
            None => tracing::info!("Content length: unknown"),
        }

        let source = DownloadSource::spawn(body, self.options.buffer_bytes());
        let received = source.received_counter();
        let name = self.endpoint.base_name().to_string();
        let max_depth = self.options.max_chain_depth;

        // The chain reads through a blocking channel, keep it off the runtime
        let chain = tokio::task::spawn_blocking(move || {
            build_chain_with_depth(Box::new(source), &name, max_depth)
        })
        .await
        .map_err(|e| ImportError::Decode(format!("decode task failed: {}", e)))??;

        let stream = DataStream::from_chain(chain, self.declared, content_length, received);
        stream.validate()?;

        tracing::info!(
            stages = ?stream.stages(),
            name = %stream.declared_name(),
            format = %stream.format(),
            "data stream ready"
        );
        Ok(stream)
    }
}

/// Fully decoded payload of one import.
///
/// Reads block until data arrives, so a stream must be consumed outside
/// the async runtime. Closing is idempotent and cascades through every
/// stage down to the backend connection; dropping the stream closes it.
pub struct DataStream {
    head: PeekReader<Stage>,
    stages: Vec<StageKind>,
    name: String,
    declared: ImageFormat,
    detected: Option<ImageFormat>,
    content_length: Option<u64>,
    received: Arc<AtomicU64>,
}

impl DataStream {
    /// `declared` is the format the endpoint's name promised
    pub(crate) fn from_chain(
        chain: TransformChain,
        declared: ImageFormat,
        content_length: Option<u64>,
        received: Arc<AtomicU64>,
    ) -> Self {
        Self {
            head: chain.head,
            stages: chain.stages,
            name: chain.name,
            declared,
            detected: chain.detected,
            content_length,
            received,
        }
    }

    /// Post-decode gate.
    ///
    /// The terminal name (a tar entry's name once an archive was opened)
    /// must be an accepted image of the declared format, and the sniffed
    /// header must agree with the declared format.
    pub(crate) fn validate(&self) -> Result<(), ImportError> {
        let terminal = declared_format(&self.name)
            .ok_or_else(|| ImportError::InvalidFormat(self.name.clone()))?;

        if let Some((wrapper, _)) = strip_outer_suffix(&self.name) {
            tracing::warn!(
                name = %self.name,
                "name declares {} encoding but the content is not {}-encoded",
                wrapper,
                wrapper
            );
        }

        if terminal != self.declared && !self.declared.accepts(Some(terminal)) {
            return Err(ImportError::FormatMismatch {
                name: self.name.clone(),
                declared: self.declared,
                detected: format!("{} (archive entry)", terminal),
            });
        }

        if !self.declared.accepts(self.detected) {
            return Err(ImportError::FormatMismatch {
                name: self.name.clone(),
                declared: self.declared,
                detected: self
                    .detected
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unrecognised data".to_string()),
            });
        }
        Ok(())
    }

    /// Decode stages applied, outermost last
    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    /// Name of the terminal payload after peeling wrappers
    pub fn declared_name(&self) -> &str {
        &self.name
    }

    /// Image signature found in the decoded header, if any
    pub fn detected_format(&self) -> Option<ImageFormat> {
        self.detected
    }

    /// Format the payload is imported as
    pub fn format(&self) -> ImageFormat {
        self.declared
    }

    /// Size reported by the backend for the raw (still encoded) object
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Raw bytes received from the backend so far
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn received_counter(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.head.get_ref().is_closed()
    }

    /// Release every stage and the backend connection. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        if !self.is_closed() {
            tracing::debug!(stages = self.stages.len(), "closing data stream");
        }
        self.head.get_mut().close();
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "data stream is closed",
            ));
        }
        self.head.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::transform::{build_chain, SourceReader};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    struct MemorySource {
        data: Cursor<Vec<u8>>,
        closes: Arc<AtomicUsize>,
    }

    impl Read for MemorySource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl SourceReader for MemorySource {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stream_of(name: &str, data: &[u8]) -> (DataStream, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let source = MemorySource {
            data: Cursor::new(data.to_vec()),
            closes: closes.clone(),
        };
        let declared = declared_format(name).unwrap();
        let chain = build_chain(Box::new(source), name).unwrap();
        let stream =
            DataStream::from_chain(chain, declared, Some(data.len() as u64), Arc::default());
        (stream, closes)
    }

    fn tar_of(entry: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, entry, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_factory_rejects_bad_names_offline() {
        for name in ["disk.exe", "disk.gz", "disk.img.zip", "archive.tar"] {
            let endpoint = format!("store.example.com/bucket/{}", name);
            assert!(
                matches!(
                    DataStreamFactory::new(&endpoint, None, None),
                    Err(ImportError::InvalidFormat(_))
                ),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_factory_config_errors() {
        assert!(matches!(
            DataStreamFactory::new("", None, None),
            Err(ImportError::Config(_))
        ));
        assert!(matches!(
            DataStreamFactory::new("store.example.com/bucket/disk.img", Some("AK"), None),
            Err(ImportError::Config(_))
        ));

        for interval in [-1.0, f64::NAN, f64::INFINITY, 1e20] {
            let mut options = ImportOptions::new("store.example.com/bucket/disk.img");
            options.progress_interval_secs = interval;
            assert!(
                matches!(
                    DataStreamFactory::from_options(options),
                    Err(ImportError::Config(_))
                ),
                "interval {} should be rejected",
                interval
            );
        }

        let mut options = ImportOptions::new("store.example.com/bucket/disk.img");
        options.progress_interval_secs = 3600.0;
        let factory = DataStreamFactory::from_options(options).unwrap();
        assert_eq!(factory.progress_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_tls_overrides_need_http_endpoint() {
        let mut options = ImportOptions::new("store.example.com/bucket/disk.img");
        options.http.insecure_tls = true;
        assert!(matches!(
            DataStreamFactory::from_options(options),
            Err(ImportError::Config(msg)) if msg.contains("TLS")
        ));

        let mut options = ImportOptions::new("https://cdn.example.com/disk.img");
        options.http.insecure_tls = true;
        assert!(DataStreamFactory::from_options(options).is_ok());
    }

    #[test]
    fn test_factory_accepts_wrapped_names() {
        let factory =
            DataStreamFactory::new("store.example.com/bucket/disk.qcow2.gz", None, None).unwrap();
        assert_eq!(factory.declared_format(), ImageFormat::Qcow2);
        assert!(factory.credentials().is_anonymous());
        assert_eq!(factory.endpoint().base_name(), "disk.qcow2.gz");
    }

    #[test]
    fn test_validate_accepts_matching_header() {
        let (stream, _) = stream_of("disk.qcow2", b"QFI\xfb\x00\x00\x00\x03");
        stream.validate().unwrap();
        assert_eq!(stream.format(), ImageFormat::Qcow2);
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let (stream, _) = stream_of("disk.qcow2", b"plain bytes, no header");
        match stream.validate() {
            Err(ImportError::FormatMismatch {
                declared, detected, ..
            }) => {
                assert_eq!(declared, ImageFormat::Qcow2);
                assert_eq!(detected, "unrecognised data");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        let (stream, _) = stream_of("disk.img", b"QFI\xfb\x00\x00\x00\x03");
        assert!(matches!(
            stream.validate(),
            Err(ImportError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_tar_entry_must_match_declared_format() {
        let closes = Arc::new(AtomicUsize::new(0));
        let source = MemorySource {
            data: Cursor::new(tar_of("other.img", &[0u8; 4096])),
            closes: closes.clone(),
        };
        let chain = build_chain(Box::new(source), "disk.qcow2.tar").unwrap();
        assert_eq!(chain.name, "other.img");

        let stream = DataStream::from_chain(chain, ImageFormat::Qcow2, None, Arc::default());
        match stream.validate() {
            Err(ImportError::FormatMismatch {
                name, declared, ..
            }) => {
                assert_eq!(name, "other.img");
                assert_eq!(declared, ImageFormat::Qcow2);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tar_entry_checked_against_endpoint_format() {
        // Entry name agrees, content does not
        let source = MemorySource {
            data: Cursor::new(tar_of("disk.qcow2", b"no qcow2 magic here")),
            closes: Arc::default(),
        };
        let chain = build_chain(Box::new(source), "bundle.qcow2.tar").unwrap();
        let stream = DataStream::from_chain(chain, ImageFormat::Qcow2, None, Arc::default());
        assert!(matches!(
            stream.validate(),
            Err(ImportError::FormatMismatch { .. })
        ));

        // An ISO inside a raw-declared archive is still raw-compatible
        let mut iso = vec![0u8; 40 * 1024];
        iso[32769..32774].copy_from_slice(b"CD001");
        let source = MemorySource {
            data: Cursor::new(tar_of("install.iso", &iso)),
            closes: Arc::default(),
        };
        let chain = build_chain(Box::new(source), "disk.img.tar").unwrap();
        let stream = DataStream::from_chain(chain, ImageFormat::Raw, None, Arc::default());
        stream.validate().unwrap();
        assert_eq!(stream.format(), ImageFormat::Raw);
    }

    #[test]
    fn test_close_twice_releases_source_once() {
        let (mut stream, closes) = stream_of("disk.raw", b"payload");
        let mut first = [0u8; 3];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"pay");

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let err = stream.read(&mut first).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes() {
        let (stream, closes) = stream_of("disk.raw", b"payload");
        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
