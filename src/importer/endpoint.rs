/// Endpoint parsing
///
/// Supports formats:
/// - host[:port]/bucket/key (object store, path-style)
/// - s3://host[:port]/bucket/key (object store)
/// - http://host[:port]/path and https://host[:port]/path (direct GET)
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::importer::error::ImportError;

/// Bytes kept verbatim in object keys: RFC 3986 unreserved characters and '/'
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    ObjectStore,
}

/// Parsed, immutable source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    /// Host name or address; IPv6 literals keep their brackets
    pub host: String,
    pub port: Option<u16>,
    /// Bucket name, object-store endpoints only
    pub bucket: Option<String>,
    /// Decoded object key, or the request path (with query) for HTTP endpoints
    pub key: String,
}

fn config_error(msg: impl Into<String>) -> ImportError {
    ImportError::Config(msg.into())
}

fn decode_segment(input: &str, segment: &str) -> Result<String, ImportError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| config_error(format!("endpoint '{}' is not valid UTF-8 once decoded", input)))
}

impl Endpoint {
    /// Resolve an endpoint string.
    ///
    /// Empty input is `Ok(None)` when `optional` is set, a configuration
    /// error otherwise.
    pub fn resolve(input: &str, optional: bool) -> Result<Option<Self>, ImportError> {
        let input = input.trim();
        if input.is_empty() {
            return if optional {
                Ok(None)
            } else {
                Err(config_error("endpoint is required but empty"))
            };
        }
        Self::parse_non_empty(input).map(Some)
    }

    /// Parse a required endpoint string
    pub fn parse(input: &str) -> Result<Self, ImportError> {
        Self::resolve(input, false)?.ok_or_else(|| config_error("endpoint is required but empty"))
    }

    fn parse_non_empty(input: &str) -> Result<Self, ImportError> {
        let (scheme, url) = match input.split_once("://") {
            Some((prefix, _)) => {
                let scheme = match prefix.to_ascii_lowercase().as_str() {
                    "http" => Scheme::Http,
                    "https" => Scheme::Https,
                    "s3" => Scheme::ObjectStore,
                    other => {
                        return Err(config_error(format!(
                            "unsupported endpoint scheme '{}'",
                            other
                        )))
                    }
                };
                (scheme, Url::parse(input))
            }
            // Bare `host/bucket/key` is an object-store endpoint
            None => (Scheme::ObjectStore, Url::parse(&format!("s3://{}", input))),
        };
        let url =
            url.map_err(|e| config_error(format!("invalid endpoint '{}': {}", input, e)))?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(config_error(
                "credentials must not be embedded in the endpoint",
            ));
        }
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(config_error("endpoint is missing the host")),
        };
        let path = url.path().strip_prefix('/').unwrap_or(url.path());

        let (bucket, key) = match scheme {
            Scheme::ObjectStore => {
                let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
                if bucket.is_empty() {
                    return Err(config_error(format!(
                        "endpoint '{}' is missing the bucket name",
                        input
                    )));
                }
                if key.trim_matches('/').is_empty() {
                    return Err(config_error(format!(
                        "endpoint '{}' is missing the object key",
                        input
                    )));
                }
                (
                    Some(decode_segment(input, bucket)?),
                    decode_segment(input, key)?,
                )
            }
            Scheme::Http | Scheme::Https => {
                if path.is_empty() {
                    return Err(config_error(format!(
                        "endpoint '{}' is missing the file path",
                        input
                    )));
                }
                let key = match url.query() {
                    Some(query) => format!("{}?{}", path, query),
                    None => path.to_string(),
                };
                (None, key)
            }
        };

        let endpoint = Self {
            scheme,
            host,
            port: url.port(),
            bucket,
            key,
        };
        if endpoint.base_name().is_empty() {
            return Err(config_error(format!(
                "endpoint '{}' does not name a file",
                input
            )));
        }
        Ok(endpoint)
    }

    /// Last path segment of the key, without query or fragment
    pub fn base_name(&self) -> &str {
        let path = self
            .key
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        path.rsplit('/').next().unwrap_or_default()
    }

    /// `host[:port]` as sent in the Host header
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) if Some(port) != self.default_port() => format!("{}:{}", self.host, port),
            _ => self.host.clone(),
        }
    }

    fn default_port(&self) -> Option<u16> {
        match self.scheme {
            Scheme::Http => Some(80),
            Scheme::Https => Some(443),
            // Depends on the transport chosen at connect time
            Scheme::ObjectStore => None,
        }
    }

    /// `scheme://host[:port]` of the server
    pub fn base_url(&self, secure: bool) -> String {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::ObjectStore if secure => "https",
            Scheme::ObjectStore => "http",
        };
        format!("{}://{}", scheme, self.authority())
    }

    /// Request path, percent-encoded for object keys
    pub fn request_path(&self) -> String {
        match &self.bucket {
            Some(bucket) => format!(
                "/{}/{}",
                utf8_percent_encode(bucket, KEY_ENCODE_SET),
                utf8_percent_encode(&self.key, KEY_ENCODE_SET)
            ),
            None => format!("/{}", self.key),
        }
    }

    /// Full URL of the object.
    ///
    /// `secure` selects HTTPS for object-store endpoints; HTTP endpoints
    /// keep their own scheme.
    pub fn url(&self, secure: bool) -> String {
        format!("{}{}", self.base_url(secure), self.request_path())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}/{}/{}", self.authority(), bucket, self.key),
            None => write!(f, "{}", self.url(true)),
        }
    }
}
