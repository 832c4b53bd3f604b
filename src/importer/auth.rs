//! Backend credentials
//!
//! Object-store requests are signed by the S3 client when a key pair is
//! given; HTTP sources send the pair as Basic authentication.

use std::fmt;

use crate::importer::error::ImportError;

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Static {
        access_key: String,
        secret_key: String,
    },
}

impl Credentials {
    /// Build credentials from an optional key pair.
    ///
    /// Empty strings count as absent. Both absent means anonymous access,
    /// exactly one present is a configuration error.
    pub fn new(access_key: Option<&str>, secret_key: Option<&str>) -> Result<Self, ImportError> {
        let access_key = access_key.map(str::trim).filter(|s| !s.is_empty());
        let secret_key = secret_key.map(str::trim).filter(|s| !s.is_empty());

        match (access_key, secret_key) {
            (None, None) => Ok(Credentials::Anonymous),
            (Some(access_key), Some(secret_key)) => Ok(Credentials::Static {
                access_key: access_key.to_string(),
                secret_key: secret_key.to_string(),
            }),
            (Some(_), None) => Err(ImportError::Config(
                "access key given without a secret key".to_string(),
            )),
            (None, Some(_)) => Err(ImportError::Config(
                "secret key given without an access key".to_string(),
            )),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }

    /// Key pair for HTTP Basic authentication, if any
    pub(crate) fn basic_auth(&self) -> Option<(&str, &str)> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Static {
                access_key,
                secret_key,
            } => Some((access_key.as_str(), secret_key.as_str())),
        }
    }

    /// Credentials in the form the S3 client signs with
    pub(crate) fn to_s3(&self) -> Result<s3::creds::Credentials, ImportError> {
        let credentials = match self {
            Credentials::Anonymous => s3::creds::Credentials::anonymous(),
            Credentials::Static {
                access_key,
                secret_key,
            } => s3::creds::Credentials::new(
                Some(access_key),
                Some(secret_key),
                None,
                None,
                None,
            ),
        };
        credentials
            .map_err(|e| ImportError::Config(format!("invalid object-store credentials: {}", e)))
    }
}

// Never print the secret
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Static { access_key, .. } => f
                .debug_struct("Static")
                .field("access_key", access_key)
                .field("secret_key", &"<redacted>")
                .finish(),
        }
    }
}
