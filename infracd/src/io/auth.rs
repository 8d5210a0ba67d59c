//! Credential files referenced from configuration and HTTP client setup.
//!
//! Secrets never live in the main configuration file. The configuration points
//! at small YAML files that are read when a client is built.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// TLS and password settings for etcd and the metrics pushgateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsAuthConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// YAML file with `username` and `password`. Ignored when a client certificate is set.
    pub password_auth: Option<PathBuf>,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Object storage settings: optional CA plus a key file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct S3AuthConfig {
    pub ca_cert: Option<PathBuf>,
    /// YAML file with `access_key` and `secret_key`.
    pub key_auth: Option<PathBuf>,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct S3KeyAuth {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for S3KeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3KeyAuth")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl TlsAuthConfig {
    pub fn resolve_password(&self) -> Result<Option<PasswordAuth>> {
        if self.client_cert.is_some() {
            return Ok(None);
        }
        match &self.password_auth {
            Some(path) => read_yaml_file(path, "password auth file").map(Some),
            None => Ok(None),
        }
    }
}

impl S3AuthConfig {
    pub fn resolve_keys(&self) -> Result<Option<S3KeyAuth>> {
        match &self.key_auth {
            Some(path) => read_yaml_file(path, "s3 key auth file").map(Some),
            None => Ok(None),
        }
    }
}

fn read_yaml_file<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read {what} {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse {what} {}", path.display()))
}

/// Options for building a blocking HTTP client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions<'a> {
    pub ca_cert: Option<&'a Path>,
    pub client_cert: Option<&'a Path>,
    pub client_key: Option<&'a Path>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl<'a> ClientOptions<'a> {
    pub fn from_tls(auth: &'a TlsAuthConfig) -> Self {
        Self {
            ca_cert: auth.ca_cert.as_deref(),
            client_cert: auth.client_cert.as_deref(),
            client_key: auth.client_key.as_deref(),
            ..Self::default()
        }
    }

    pub fn build(self) -> Result<Client> {
        let mut builder = Client::builder();
        if let Some(ca) = self.ca_cert {
            let pem = fs::read(ca).with_context(|| format!("read ca cert {}", ca.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parse ca cert {}", ca.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (self.client_cert, self.client_key) {
            let mut pem =
                fs::read(cert).with_context(|| format!("read client cert {}", cert.display()))?;
            pem.push(b'\n');
            pem.extend(
                fs::read(key).with_context(|| format!("read client key {}", key.display()))?,
            );
            let identity =
                reqwest::Identity::from_pem(&pem).context("parse client cert and key")?;
            builder = builder.identity(identity);
        }
        if let Some(timeout) = self.connect_timeout.filter(|t| !t.is_zero()) {
            builder = builder.connect_timeout(timeout);
        }
        // The blocking client defaults to a 30s timeout; None means no limit.
        builder = builder.timeout(self.request_timeout.filter(|t| !t.is_zero()));
        builder.build().context("build http client")
    }
}
