//! etcd-backed state store speaking the v3 JSON gateway.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{STATE_FILE_NAME, StateStore};
use crate::core::duration;
use crate::core::types::State;
use crate::io::auth::{ClientOptions, TlsAuthConfig};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Prepended verbatim to the record name.
    pub prefix: String,
    pub endpoints: Vec<String>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub connection_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub request_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub retry_interval: Option<Duration>,
    /// Extra attempts over the whole endpoint list after the first one.
    pub retries: u64,
    pub auth: TlsAuthConfig,
}

impl EtcdConfig {
    pub fn is_defined(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub fn key(&self) -> String {
        format!("{}{STATE_FILE_NAME}", self.prefix)
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    token: String,
}

#[derive(Serialize)]
struct AuthenticateRequest<'a> {
    name: &'a str,
    password: &'a str,
}

struct Session {
    client: Client,
    token: Option<String>,
}

/// State record stored under a single etcd key.
pub struct EtcdStateStore {
    conf: EtcdConfig,
    session: Option<Session>,
}

impl EtcdStateStore {
    pub fn new(conf: EtcdConfig) -> Self {
        Self {
            conf,
            session: None,
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("etcd state store used before initialization"))
    }

    /// Send `body` to `path` on the first endpoint that answers, retrying the
    /// whole endpoint list `retries` more times.
    fn call(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let session = self.session()?;
        let interval = self.conf.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL);
        let mut last_err = None;
        for attempt in 0..=self.conf.retries {
            if attempt > 0 {
                thread::sleep(interval);
            }
            for endpoint in &self.conf.endpoints {
                match post(session, endpoint, path, body) {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        warn!(endpoint = %endpoint, attempt, err = %format!("{err:#}"), "etcd request failed");
                        last_err = Some(err);
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("no etcd endpoints configured"))
            .context(format!("etcd request {path} failed on every endpoint")))
    }
}

fn endpoint_url(endpoint: &str, path: &str) -> String {
    let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    };
    format!("{base}{path}")
}

fn post(
    session: &Session,
    endpoint: &str,
    path: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut request = session.client.post(endpoint_url(endpoint, path)).json(body);
    if let Some(token) = &session.token {
        request = request.header("Authorization", token);
    }
    let response = request.send().with_context(|| format!("send {path} to {endpoint}"))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().unwrap_or_default();
        bail!("etcd {path} on {endpoint} returned {status}: {}", text.trim());
    }
    response
        .json()
        .with_context(|| format!("decode etcd {path} response"))
}

impl StateStore for EtcdStateStore {
    #[instrument(skip_all, fields(endpoints = self.conf.endpoints.len()))]
    fn initialize(&mut self) -> Result<()> {
        let client = ClientOptions {
            connect_timeout: self.conf.connection_timeout,
            request_timeout: self.conf.request_timeout,
            ..ClientOptions::from_tls(&self.conf.auth)
        }
        .build()
        .context("build etcd client")?;
        self.session = Some(Session {
            client,
            token: None,
        });

        if let Some(creds) = self.conf.auth.resolve_password()? {
            let request = serde_json::to_value(AuthenticateRequest {
                name: &creds.username,
                password: &creds.password,
            })
            .context("encode etcd authenticate request")?;
            let response = self.call("/v3/auth/authenticate", &request)?;
            let auth: AuthenticateResponse =
                serde_json::from_value(response).context("decode etcd authenticate response")?;
            if let Some(session) = self.session.as_mut() {
                session.token = Some(auth.token);
            }
            debug!("authenticated to etcd");
        }
        Ok(())
    }

    fn read(&mut self) -> Result<State> {
        let key = self.conf.key();
        let response = self.call("/v3/kv/range", &json!({ "key": BASE64.encode(&key) }))?;
        let range: RangeResponse =
            serde_json::from_value(response).context("decode etcd range response")?;
        let Some(kv) = range.kvs.into_iter().next() else {
            debug!(key = %key, "no state recorded in etcd yet");
            return Ok(State::default());
        };
        let raw = BASE64
            .decode(kv.value.as_bytes())
            .context("decode etcd state value")?;
        serde_yaml::from_slice(&raw).context("deserialize state from etcd")
    }

    fn write(&mut self, state: &State) -> Result<()> {
        let raw = serde_yaml::to_string(state).context("serialize state")?;
        self.call(
            "/v3/kv/put",
            &json!({
                "key": BASE64.encode(self.conf.key()),
                "value": BASE64.encode(raw),
            }),
        )?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.session = None;
        Ok(())
    }
}
