//! Minimal S3-compatible object storage client.
//!
//! Path-style requests signed with SigV4 over a blocking HTTP client. Only the
//! operations the state store and the provider cache need are implemented:
//! get, put, delete, list, and directory synchronization in both directions.

pub mod sigv4;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use self::sigv4::{CanonicalRequest, EMPTY_PAYLOAD_SHA256, Signer, sha256_hex, uri_encode};
use super::auth::{ClientOptions, S3AuthConfig};
use super::fs::{ensure_private_dir, find_files, remove_dir_if_exists, write_private};
use crate::core::duration;

const DEFAULT_REGION: &str = "us-east-1";

/// Worker threads used by bulk synchronization.
const SYNC_WORKERS: usize = 8;

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Key>([^<]*)</Key>").expect("valid regex"));
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>").expect("valid regex")
});
static TRUNCATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").expect("valid regex"));

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Host (optionally with port), or a full `http(s)://` base url.
    pub endpoint: String,
    pub bucket: String,
    /// Key prefix under which objects live.
    pub path: String,
    pub region: String,
    pub auth: S3AuthConfig,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub connection_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration::deserialize_opt")]
    pub request_timeout: Option<Duration>,
}

impl S3Config {
    pub fn is_defined(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Key prefix with a trailing slash, or empty.
    pub fn prefix(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }

    /// Object key for `name` under the configured path.
    pub fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix())
    }
}

/// Blocking client bound to one bucket.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    base: Url,
    bucket: String,
    signer: Option<Signer>,
}

impl ObjectStore {
    pub fn connect(conf: &S3Config) -> Result<Self> {
        if conf.bucket.is_empty() {
            bail!("s3 bucket must be set");
        }
        let endpoint = if conf.endpoint.starts_with("http://") || conf.endpoint.starts_with("https://")
        {
            conf.endpoint.clone()
        } else {
            format!("https://{}", conf.endpoint)
        };
        let base = Url::parse(&endpoint).with_context(|| format!("parse s3 endpoint {endpoint}"))?;
        let client = ClientOptions {
            ca_cert: conf.auth.ca_cert.as_deref(),
            connect_timeout: conf.connection_timeout,
            request_timeout: conf.request_timeout,
            ..ClientOptions::default()
        }
        .build()?;
        let region = if conf.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            conf.region.clone()
        };
        let signer = conf.auth.resolve_keys()?.map(|keys| Signer {
            access_key: keys.access_key,
            secret_key: keys.secret_key,
            region,
        });
        Ok(Self {
            client,
            base,
            bucket: conf.bucket.clone(),
            signer,
        })
    }

    fn host_header(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Absolute, encoded request path for `key` (empty key addresses the bucket).
    fn object_path(&self, key: &str) -> String {
        let base_path = self.base.path().trim_end_matches('/');
        let mut path = format!("{base_path}/{}", uri_encode(&self.bucket, true));
        if !key.is_empty() {
            path.push('/');
            path.push_str(&uri_encode(key, false));
        }
        path
    }

    fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<RequestBuilder> {
        let path = self.object_path(key);
        let mut url = self.base.clone();
        url.set_path(&path);
        if query.is_empty() {
            url.set_query(None);
        } else {
            let encoded = query
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&encoded));
        }

        let payload_sha256 = match &body {
            Some(bytes) => sha256_hex(bytes),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut builder = self
            .client
            .request(method.clone(), url)
            .header("x-amz-date", &amz_date)
            .header("x-amz-content-sha256", &payload_sha256);
        if let Some(signer) = &self.signer {
            let mut headers = BTreeMap::new();
            headers.insert("host".to_string(), self.host_header());
            headers.insert("x-amz-content-sha256".to_string(), payload_sha256.clone());
            headers.insert("x-amz-date".to_string(), amz_date.clone());
            let canonical = CanonicalRequest {
                method: method.as_str(),
                uri: &path,
                query,
                headers: &headers,
                payload_sha256: &payload_sha256,
            };
            builder = builder.header("authorization", signer.authorization(&canonical, &amz_date));
        }
        if let Some(bytes) = body {
            builder = builder.body(bytes);
        }
        Ok(builder)
    }

    /// Object contents, or `None` when the key does not exist.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .request(reqwest::Method::GET, key, &[], None)?
            .send()
            .with_context(|| format!("get s3 object '{key}'"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "get", key)?;
        let bytes = response
            .bytes()
            .with_context(|| format!("read s3 object '{key}'"))?;
        Ok(Some(bytes.to_vec()))
    }

    pub fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, key, &[], Some(body))?
            .send()
            .with_context(|| format!("put s3 object '{key}'"))?;
        check_status(response, "put", key)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, key, &[], None)?
            .send()
            .with_context(|| format!("delete s3 object '{key}'"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete", key)?;
        Ok(())
    }

    /// Every key starting with `prefix`.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &token {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            let response = self
                .request(reqwest::Method::GET, "", &query, None)?
                .send()
                .with_context(|| format!("list s3 bucket '{}'", self.bucket))?;
            let body = check_status(response, "list", prefix)?
                .text()
                .context("read s3 list response")?;
            let page = parse_list_page(&body);
            keys.extend(page.keys);
            match page.next_token {
                Some(next) if page.truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(keys)
    }
}

fn check_status(
    response: reqwest::blocking::Response,
    op: &str,
    key: &str,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(anyhow!("s3 {op} '{key}' failed with status {status}: {}", body.trim()))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ListPage {
    keys: Vec<String>,
    next_token: Option<String>,
    truncated: bool,
}

fn parse_list_page(body: &str) -> ListPage {
    ListPage {
        keys: KEY_RE
            .captures_iter(body)
            .map(|caps| xml_unescape(&caps[1]))
            .collect(),
        next_token: TOKEN_RE.captures(body).map(|caps| xml_unescape(&caps[1])),
        truncated: TRUNCATED_RE.is_match(body),
    }
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Run `task` over `items` on a bounded pool of scoped threads.
///
/// A failing item does not stop the others; all are awaited and the first
/// reported error (plus a count) is returned.
fn run_parallel<T, F>(items: Vec<T>, task: F) -> Result<()>
where
    T: Send,
    F: Fn(T) -> Result<()> + Sync,
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = SYNC_WORKERS.min(items.len());
    let mut buckets: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for (idx, item) in items.into_iter().enumerate() {
        buckets[idx % workers].push(item);
    }

    let (tx, rx) = mpsc::channel::<anyhow::Error>();
    thread::scope(|scope| {
        for bucket in buckets {
            let tx = tx.clone();
            let task = &task;
            scope.spawn(move || {
                for item in bucket {
                    if let Err(err) = task(item) {
                        let _ = tx.send(err);
                    }
                }
            });
        }
    });
    drop(tx);

    let errors: Vec<anyhow::Error> = rx.into_iter().collect();
    let failed = errors.len();
    match errors.into_iter().next() {
        None => Ok(()),
        Some(first) => Err(first.context(format!("{failed} object transfer(s) failed"))),
    }
}

/// Replace `dir` with the objects stored under the configured prefix.
#[instrument(skip_all, fields(bucket = %conf.bucket, dir = %dir.display()))]
pub fn sync_to_fs(conf: &S3Config, dir: &Path) -> Result<()> {
    remove_dir_if_exists(dir).context("clean up target s3 sync directory")?;
    ensure_private_dir(dir)?;
    let store = ObjectStore::connect(conf)?;
    let prefix = conf.prefix();
    let keys = store.list(&prefix)?;
    debug!(objects = keys.len(), "downloading objects");

    let jobs: Vec<(String, PathBuf)> = keys
        .into_iter()
        .filter_map(|key| {
            let dest = local_path(dir, &prefix, &key)?;
            Some((key, dest))
        })
        .collect();
    let count = jobs.len();
    run_parallel(jobs, |(key, dest)| {
        let body = store
            .get(&key)?
            .with_context(|| format!("s3 object '{key}' disappeared during sync"))?;
        if let Some(parent) = dest.parent() {
            ensure_private_dir(parent)?;
        }
        write_private(&dest, &body)
            .with_context(|| format!("copy s3 key '{key}' into {}", dest.display()))
    })?;
    info!(objects = count, "synchronized object storage to filesystem");
    Ok(())
}

/// Where `key` lands under `dir`. Directory markers and keys that would
/// escape `dir` map to `None`.
fn local_path(dir: &Path, prefix: &str, key: &str) -> Option<PathBuf> {
    let rel = key.strip_prefix(prefix)?;
    if rel.is_empty() || rel.ends_with('/') {
        return None;
    }
    let rel = Path::new(rel);
    if !rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        warn!(key, "skipping object key outside the sync directory");
        return None;
    }
    Some(dir.join(rel))
}

/// Replace the objects under the configured prefix with the contents of `dir`.
#[instrument(skip_all, fields(bucket = %conf.bucket, dir = %dir.display()))]
pub fn sync_from_fs(conf: &S3Config, dir: &Path) -> Result<()> {
    let store = ObjectStore::connect(conf)?;
    let prefix = conf.prefix();

    let stale = store.list(&prefix)?;
    run_parallel(stale, |key| store.delete(&key)).context("clear s3 prefix")?;

    let files = find_files(dir, "*")?;
    let jobs: Vec<(PathBuf, String)> = files
        .into_iter()
        .map(|file| {
            let rel = file
                .strip_prefix(dir)
                .with_context(|| format!("relativize {}", file.display()))?
                .to_string_lossy()
                .replace('\\', "/");
            Ok((file, format!("{prefix}{rel}")))
        })
        .collect::<Result<_>>()?;
    let count = jobs.len();
    run_parallel(jobs, |(file, key)| {
        let body = fs::read(&file).with_context(|| format!("read {}", file.display()))?;
        store
            .put(&key, body)
            .with_context(|| format!("copy {} to s3", file.display()))
    })?;
    info!(objects = count, "synchronized filesystem to object storage");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn prefix_is_normalized() {
        let mut conf = S3Config::default();
        assert_eq!(conf.key("state.yml"), "state.yml");
        conf.path = "/env/prod/".to_string();
        assert_eq!(conf.prefix(), "env/prod/");
        assert_eq!(conf.key("state.yml"), "env/prod/state.yml");
    }

    #[test]
    fn synced_keys_stay_inside_target_directory() {
        let dir = Path::new("/srv/infracd/cache");
        assert_eq!(
            local_path(dir, "cache/", "cache/.terraform/providers/plugin"),
            Some(dir.join(".terraform/providers/plugin"))
        );
        assert_eq!(local_path(dir, "cache/", "cache/../../etc/passwd"), None);
        assert_eq!(local_path(dir, "cache/", "cache/a/../../b"), None);
        assert_eq!(local_path(dir, "cache/", "cache//etc/passwd"), None);
        assert_eq!(local_path(dir, "cache/", "cache/dir/"), None);
        assert_eq!(local_path(dir, "cache/", "other/file"), None);
    }

    #[test]
    fn list_page_is_parsed() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>cache/a&amp;b</Key></Contents>
  <Contents><Key>cache/.terraform.lock.hcl</Key></Contents>
  <NextContinuationToken>tok==</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_page(body);
        assert_eq!(page.keys, vec!["cache/a&b", "cache/.terraform.lock.hcl"]);
        assert_eq!(page.next_token.as_deref(), Some("tok=="));
        assert!(page.truncated);
    }

    #[test]
    fn parallel_runner_awaits_all_items_and_reports_failures() {
        let seen = AtomicUsize::new(0);
        let result = run_parallel((0..20).collect(), |n: usize| {
            seen.fetch_add(1, Ordering::SeqCst);
            if n % 5 == 0 {
                Err(anyhow!("item {n} failed"))
            } else {
                Ok(())
            }
        });
        assert_eq!(seen.load(Ordering::SeqCst), 20);
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("4 object transfer(s) failed"));
    }

    #[test]
    fn object_paths_are_path_style() {
        let conf = S3Config {
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: "infra".to_string(),
            ..S3Config::default()
        };
        let store = ObjectStore::connect(&conf).expect("connect");
        assert_eq!(store.object_path("a b/c.yml"), "/infra/a%20b/c.yml");
        assert_eq!(store.object_path(""), "/infra");
        assert_eq!(store.host_header(), "127.0.0.1:9000");
    }
}
