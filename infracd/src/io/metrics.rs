//! Run outcome metrics pushed to a Prometheus pushgateway.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use super::auth::{ClientOptions, TlsAuthConfig};
use crate::core::types::{Command, RunOutcome};
use crate::error::{Categorize, RunError};

const PROVIDERS_DIR: &str = ".terraform/providers";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PushgatewayConfig {
    pub url: String,
    pub auth: TlsAuthConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub job_name: String,
    /// Also report the providers found in the workspace.
    pub include_providers: bool,
    pub pushgateway: PushgatewayConfig,
}

impl MetricsConfig {
    pub fn is_defined(&self) -> bool {
        !self.job_name.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_defined() && self.pushgateway.url.is_empty() {
            bail!("metrics.pushgateway.url is required when metrics.job_name is set");
        }
        Ok(())
    }
}

/// A provider plugin found under `.terraform/providers`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Provider {
    pub registry: String,
    pub organisation: String,
    pub name: String,
    pub version: String,
}

/// Enumerate `<registry>/<org>/<name>/<version>` directories in the workspace.
pub fn discover_providers(work: &Path) -> Result<Vec<Provider>> {
    let root = work.join(PROVIDERS_DIR);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut providers = Vec::new();
    for entry in WalkDir::new(&root).min_depth(4).max_depth(4) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(&root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if let [registry, organisation, name, version] = parts.as_slice() {
            providers.push(Provider {
                registry: registry.clone(),
                organisation: organisation.clone(),
                name: name.clone(),
                version: version.clone(),
            });
        }
    }
    providers.sort();
    Ok(providers)
}

/// Encode one run record in the Prometheus text format.
pub fn encode(
    command: Command,
    outcome: RunOutcome,
    at: DateTime<Utc>,
    providers: &[Provider],
) -> Result<Vec<u8>> {
    let registry = Registry::new();
    let timestamp = at.timestamp_millis() as f64 / 1000.0;

    let command_gauge = GaugeVec::new(
        Opts::new(
            "infracd_command_timestamp_seconds",
            "Time the last command finished, by command and result",
        ),
        &["command", "result"],
    )?;
    registry.register(Box::new(command_gauge.clone()))?;
    command_gauge
        .with_label_values(&[command.as_str(), outcome.as_str()])
        .set(timestamp);

    if !providers.is_empty() {
        let provider_gauge = GaugeVec::new(
            Opts::new(
                "infracd_provider_use_timestamp_seconds",
                "Time a provider was last used by a run",
            ),
            &["registry", "organisation", "provider", "version"],
        )?;
        registry.register(Box::new(provider_gauge.clone()))?;
        for provider in providers {
            provider_gauge
                .with_label_values(&[
                    provider.registry.as_str(),
                    provider.organisation.as_str(),
                    provider.name.as_str(),
                    provider.version.as_str(),
                ])
                .set(timestamp);
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encode metrics")?;
    Ok(buffer)
}

impl MetricsConfig {
    /// Replace this job's metrics on the pushgateway with `body`.
    #[instrument(skip_all, fields(job = %self.job_name))]
    pub fn push(&self, body: Vec<u8>) -> Result<()> {
        self.push_inner(body).categorize(RunError::Metrics)
    }

    fn push_inner(&self, body: Vec<u8>) -> Result<()> {
        let client = ClientOptions::from_tls(&self.pushgateway.auth).build()?;
        let url = format!(
            "{}/metrics/job/{}",
            self.pushgateway.url.trim_end_matches('/'),
            self.job_name
        );
        let mut request = client
            .put(&url)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(body);
        if let Some(creds) = self.pushgateway.auth.resolve_password()? {
            request = request.basic_auth(creds.username, Some(creds.password));
        }
        debug!(url = %url, "pushing metrics");
        let response = request
            .send()
            .with_context(|| format!("push metrics to {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("pushgateway {url} returned {status}");
        }
        info!("metrics pushed");
        Ok(())
    }
}
