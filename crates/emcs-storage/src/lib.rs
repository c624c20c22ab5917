//! Identity cache persistence + identity-resolution clients.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use emcs_core::{FactCategory, IdentityBatch};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emcs-storage";

/// Current on-disk layout of the identity cache file.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// see either the previous file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<WrittenFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let write_result = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

#[derive(Debug, Error)]
pub enum CacheLoadError {
    #[error("identity cache not found at {}", .0.display())]
    Missing(PathBuf),
    #[error("reading identity cache {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing identity cache {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "identity cache {} has schema_version {found:?}; this build reads version {expected}",
        path.display()
    )]
    UnsupportedVersion {
        path: PathBuf,
        found: Option<u64>,
        expected: u32,
    },
    #[error("identity cache {} is inconsistent: {detail}", path.display())]
    Inconsistent { path: PathBuf, detail: String },
}

#[derive(Debug, Error)]
pub enum CachePersistError {
    #[error("identity cache already exists at {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("serializing identity cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing identity cache: {0:#}")]
    Write(anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheMergeError {
    #[error("identifier {0} is already cached")]
    AlreadyCached(String),
    #[error("identifier {0} appears more than once in the merged directory")]
    DuplicateEntry(String),
    #[error("fact references identifier {0} with no directory entry")]
    Orphan(String),
}

#[derive(Serialize)]
struct CacheFileOut<'a> {
    schema_version: u32,
    #[serde(flatten)]
    batch: &'a IdentityBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub directory: usize,
    pub assets: usize,
    pub claims: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "directory={} assets={} claims={}",
            self.directory, self.assets, self.claims
        )
    }
}

/// Append-only store of resolved identities, indexed by identifier.
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    records: IdentityBatch,
    index: HashMap<String, usize>,
}

impl IdentityCache {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a cache from raw collections, checking the directory/fact invariants.
    pub fn from_batch(records: IdentityBatch) -> Result<Self, String> {
        let mut index = HashMap::with_capacity(records.directory.len());
        for (pos, entry) in records.directory.iter().enumerate() {
            if index.insert(entry.identifier_email.clone(), pos).is_some() {
                return Err(format!(
                    "duplicate directory entry for {}",
                    entry.identifier_email
                ));
            }
        }
        if let Some(asset) = records
            .assets
            .iter()
            .find(|a| !index.contains_key(&a.identifier_email))
        {
            return Err(format!(
                "asset references unknown identifier {}",
                asset.identifier_email
            ));
        }
        if let Some(claim) = records
            .claims
            .iter()
            .find(|c| !index.contains_key(&c.subject_identifier_email))
        {
            return Err(format!(
                "claim references unknown identifier {}",
                claim.subject_identifier_email
            ));
        }
        Ok(Self { records, index })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CacheLoadError> {
        let path = path.as_ref();
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheLoadError::Missing(path.to_path_buf()));
            }
            Err(source) => {
                return Err(CacheLoadError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let malformed = |source| CacheLoadError::Malformed {
            path: path.to_path_buf(),
            source,
        };

        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(malformed)?;
        let found = value.get("schema_version").and_then(|v| v.as_u64());
        if found != Some(u64::from(CACHE_SCHEMA_VERSION)) {
            return Err(CacheLoadError::UnsupportedVersion {
                path: path.to_path_buf(),
                found,
                expected: CACHE_SCHEMA_VERSION,
            });
        }
        let records: IdentityBatch = serde_json::from_value(value).map_err(malformed)?;
        let cache = Self::from_batch(records).map_err(|detail| CacheLoadError::Inconsistent {
            path: path.to_path_buf(),
            detail,
        })?;
        info!(path = %path.display(), stats = %cache.stats(), "loaded identity cache");
        Ok(cache)
    }

    /// Write an empty, valid cache file. The file is created with
    /// `create_new`, so an existing file at `path` is never replaced.
    pub async fn init(path: impl AsRef<Path>) -> Result<WrittenFile, CachePersistError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(&CacheFileOut {
            schema_version: CACHE_SCHEMA_VERSION,
            batch: &IdentityBatch::default(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))
                .map_err(CachePersistError::Write)?;
        }

        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CachePersistError::AlreadyExists(path.to_path_buf()));
            }
            Err(err) => {
                return Err(CachePersistError::Write(
                    anyhow::Error::new(err).context(format!("creating {}", path.display())),
                ));
            }
        };
        let write_result = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = write_result {
            let _ = fs::remove_file(path).await;
            return Err(CachePersistError::Write(
                anyhow::Error::new(err).context(format!("writing {}", path.display())),
            ));
        }

        info!(path = %path.display(), "initialised empty identity cache");
        Ok(WrittenFile {
            path: path.to_path_buf(),
            content_hash: sha256_hex(&bytes),
            byte_size: bytes.len(),
        })
    }

    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<WrittenFile, CachePersistError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(&CacheFileOut {
            schema_version: CACHE_SCHEMA_VERSION,
            batch: &self.records,
        })?;
        let written = write_atomic(path, &bytes)
            .await
            .map_err(CachePersistError::Write)?;
        info!(
            path = %path.display(),
            bytes = written.byte_size,
            stats = %self.stats(),
            "persisted identity cache"
        );
        Ok(written)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.index.contains_key(identifier)
    }

    pub fn known_identifiers(&self) -> HashSet<&str> {
        self.index.keys().map(String::as_str).collect()
    }

    /// Append `new` onto the cache. Every directory entry must be new and
    /// unique, and every fact must reference a cached or incoming entry;
    /// otherwise nothing is appended.
    pub fn merge(&mut self, new: IdentityBatch) -> Result<(), CacheMergeError> {
        let mut incoming = HashSet::with_capacity(new.directory.len());
        for entry in &new.directory {
            let id = entry.identifier_email.as_str();
            if self.index.contains_key(id) {
                return Err(CacheMergeError::AlreadyCached(id.to_string()));
            }
            if !incoming.insert(id) {
                return Err(CacheMergeError::DuplicateEntry(id.to_string()));
            }
        }
        let known = |id: &str| self.index.contains_key(id) || incoming.contains(id);
        if let Some(asset) = new.assets.iter().find(|a| !known(&a.identifier_email)) {
            return Err(CacheMergeError::Orphan(asset.identifier_email.clone()));
        }
        if let Some(claim) = new
            .claims
            .iter()
            .find(|c| !known(&c.subject_identifier_email))
        {
            return Err(CacheMergeError::Orphan(
                claim.subject_identifier_email.clone(),
            ));
        }

        let IdentityBatch {
            directory,
            assets,
            claims,
        } = new;
        for entry in directory {
            self.index
                .insert(entry.identifier_email.clone(), self.records.directory.len());
            self.records.directory.push(entry);
        }
        self.records.assets.extend(assets);
        self.records.claims.extend(claims);
        Ok(())
    }

    pub fn records(&self) -> &IdentityBatch {
        &self.records
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            directory: self.records.directory.len(),
            assets: self.records.assets.len(),
            claims: self.records.claims.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding resolver response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// External identity-resolution service.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        identifiers: &BTreeSet<String>,
        categories: &[FactCategory],
    ) -> Result<IdentityBatch, ResolveError>;
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    identifiers: Vec<&'a str>,
    datatypes: Vec<&'static str>,
}

/// Resolver backed by `POST {base_url}/resolve`.
#[derive(Debug)]
pub struct HttpIdentityResolver {
    client: reqwest::Client,
    endpoint: String,
    backoff: BackoffPolicy,
}

impl HttpIdentityResolver {
    pub fn new(base_url: &str, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/resolve", base_url.trim_end_matches('/')),
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post_with_retry(&self, body: &ResolveRequest<'_>) -> Result<IdentityBatch, ResolveError> {
        let mut attempt = 0usize;
        loop {
            match self.client.post(&self.endpoint).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        let batch: IdentityBatch = serde_json::from_slice(&bytes)?;
                        debug!(
                            directory = batch.directory.len(),
                            assets = batch.assets.len(),
                            claims = batch.claims.len(),
                            "resolver responded"
                        );
                        return Ok(batch);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable resolver status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(ResolveError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable resolver error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ResolveError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn resolve(
        &self,
        identifiers: &BTreeSet<String>,
        categories: &[FactCategory],
    ) -> Result<IdentityBatch, ResolveError> {
        let body = ResolveRequest {
            identifiers: identifiers.iter().map(String::as_str).collect(),
            datatypes: categories.iter().map(|c| c.as_str()).collect(),
        };
        let span = info_span!("resolve", endpoint = %self.endpoint, identifiers = identifiers.len());
        self.post_with_retry(&body).instrument(span).await
    }
}

/// Resolver answering from a captured response file of the same shape as the
/// service's reply. Only requested identifiers are returned.
#[derive(Debug, Clone)]
pub struct FixtureIdentityResolver {
    records: IdentityBatch,
}

impl FixtureIdentityResolver {
    pub fn new(records: IdentityBatch) -> Self {
        Self { records }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let records: IdentityBatch =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(records))
    }
}

#[async_trait]
impl IdentityResolver for FixtureIdentityResolver {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn resolve(
        &self,
        identifiers: &BTreeSet<String>,
        categories: &[FactCategory],
    ) -> Result<IdentityBatch, ResolveError> {
        let wants = |category| categories.contains(&category);
        let mut out = IdentityBatch::default();
        if wants(FactCategory::Directory) {
            out.directory = self
                .records
                .directory
                .iter()
                .filter(|d| identifiers.contains(&d.identifier_email))
                .cloned()
                .collect();
        }
        if wants(FactCategory::Assets) {
            out.assets = self
                .records
                .assets
                .iter()
                .filter(|a| identifiers.contains(&a.identifier_email))
                .cloned()
                .collect();
        }
        if wants(FactCategory::Claims) {
            out.claims = self
                .records
                .claims
                .iter()
                .filter(|c| identifiers.contains(&c.subject_identifier_email))
                .cloned()
                .collect();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emcs_core::{AssetRecord, ClaimRecord, IdentityRecord};
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Deserialize)]
    struct CacheFileIn {
        schema_version: u32,
    }

    fn person(email: &str) -> IdentityRecord {
        IdentityRecord {
            identifier_email: email.to_string(),
            displayname: Some(email.to_uppercase()),
            jobtitle: None,
            organization_name: Some("USGS".into()),
            organization_uri: None,
            url: None,
        }
    }

    fn asset(email: &str, kind: &str, year: i32) -> AssetRecord {
        AssetRecord {
            identifier_email: email.to_string(),
            additionaltype: kind.to_string(),
            datepublished: Some(year),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_target_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        write_atomic(&path, b"first").await.expect("first write");
        let written = write_atomic(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(written.byte_size, 6);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn missing_cache_is_a_load_error() {
        let dir = tempdir().expect("tempdir");
        let err = IdentityCache::load(dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheLoadError::Missing(_)));
    }

    #[tokio::test]
    async fn unknown_schema_version_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"schema_version": 7, "directory": []}"#).unwrap();
        let err = IdentityCache::load(&path).await.unwrap_err();
        assert!(matches!(
            err,
            CacheLoadError::UnsupportedVersion { found: Some(7), .. }
        ));

        std::fs::write(&path, r#"{"directory": []}"#).unwrap();
        let err = IdentityCache::load(&path).await.unwrap_err();
        assert!(matches!(err, CacheLoadError::UnsupportedVersion { found: None, .. }));
    }

    #[tokio::test]
    async fn garbage_cache_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"\x80\x04pickle").unwrap();
        let err = IdentityCache::load(&path).await.unwrap_err();
        assert!(matches!(err, CacheLoadError::Malformed { .. }));
    }

    #[test]
    fn invariants_are_checked_on_construction() {
        let dup = IdentityBatch {
            directory: vec![person("a@x"), person("a@x")],
            ..Default::default()
        };
        assert!(IdentityCache::from_batch(dup).is_err());

        let orphan = IdentityBatch {
            directory: vec![person("a@x")],
            assets: vec![asset("b@x", "Dataset", 2020)],
            ..Default::default()
        };
        assert!(IdentityCache::from_batch(orphan).is_err());

        let orphan_claim = IdentityBatch {
            directory: vec![person("a@x")],
            claims: vec![ClaimRecord {
                subject_identifier_email: "z@x".into(),
                property_label: "keyword".into(),
                object_label: "rivers".into(),
            }],
            ..Default::default()
        };
        assert!(IdentityCache::from_batch(orphan_claim).is_err());
    }

    #[tokio::test]
    async fn merge_persist_and_reload_keeps_existing_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        IdentityCache::init(&path).await.expect("init");

        let mut cache = IdentityCache::load(&path).await.expect("load empty");
        assert_eq!(cache.stats(), CacheStats::default());

        cache
            .merge(IdentityBatch {
                directory: vec![person("a@x")],
                assets: vec![asset("a@x", "Publication", 2011)],
                claims: vec![],
            })
            .expect("merge a");
        let before = cache.records().directory[0].clone();
        cache
            .merge(IdentityBatch {
                directory: vec![person("b@x")],
                ..Default::default()
            })
            .expect("merge b");
        cache.persist(&path).await.expect("persist");

        let reloaded = IdentityCache::load(&path).await.expect("reload");
        assert!(reloaded.contains("a@x"));
        assert!(reloaded.contains("b@x"));
        assert!(!reloaded.contains("A@x"));
        assert_eq!(reloaded.records().directory[0], before);
        assert_eq!(
            reloaded.stats(),
            CacheStats {
                directory: 2,
                assets: 1,
                claims: 0
            }
        );
        assert_eq!(
            reloaded.known_identifiers(),
            HashSet::from(["a@x", "b@x"])
        );

        let raw: CacheFileIn =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.schema_version, CACHE_SCHEMA_VERSION);
    }

    #[test]
    fn merge_rejects_cached_duplicate_and_orphan_records_without_appending() {
        let mut cache = IdentityCache::from_batch(IdentityBatch {
            directory: vec![person("a@x")],
            ..Default::default()
        })
        .unwrap();
        let snapshot = cache.records().clone();

        let err = cache
            .merge(IdentityBatch {
                directory: vec![person("b@x"), person("a@x")],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, CacheMergeError::AlreadyCached("a@x".into()));

        let err = cache
            .merge(IdentityBatch {
                directory: vec![person("b@x"), person("b@x")],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, CacheMergeError::DuplicateEntry("b@x".into()));

        let err = cache
            .merge(IdentityBatch {
                directory: vec![person("b@x")],
                assets: vec![asset("z@x", "Dataset", 2020)],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, CacheMergeError::Orphan("z@x".into()));

        assert_eq!(cache.records(), &snapshot);
        assert!(!cache.contains("b@x"));

        // Facts for an already cached identity are accepted.
        cache
            .merge(IdentityBatch {
                directory: vec![person("b@x")],
                assets: vec![asset("a@x", "Dataset", 2021)],
                ..Default::default()
            })
            .expect("merge");
        assert_eq!(cache.stats().assets, 1);
        assert!(IdentityCache::from_batch(cache.records().clone()).is_ok());
    }

    #[tokio::test]
    async fn init_surfaces_io_errors() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "x").unwrap();
        let err = IdentityCache::init(blocker.join("cache.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, CachePersistError::Write(_)));
    }

    #[tokio::test]
    async fn init_writes_a_loadable_empty_cache() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("cache.json");
        let written = IdentityCache::init(&path).await.expect("init");
        assert_eq!(written.byte_size, std::fs::metadata(&path).unwrap().len() as usize);
        let cache = IdentityCache::load(&path).await.expect("load");
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn init_refuses_to_overwrite() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{}").unwrap();
        let err = IdentityCache::init(&path).await.unwrap_err();
        assert!(matches!(err, CachePersistError::AlreadyExists(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn fixture_resolver_returns_only_requested_identifiers() {
        let resolver = FixtureIdentityResolver::new(IdentityBatch {
            directory: vec![person("a@x"), person("b@x")],
            assets: vec![asset("a@x", "Dataset", 2019), asset("b@x", "Dataset", 2020)],
            claims: vec![],
        });
        let wanted = BTreeSet::from(["b@x".to_string(), "c@x".to_string()]);
        let batch = resolver
            .resolve(&wanted, &FactCategory::ALL)
            .await
            .expect("resolve");
        assert_eq!(batch.directory.len(), 1);
        assert_eq!(batch.directory[0].identifier_email, "b@x");
        assert_eq!(batch.assets, vec![asset("b@x", "Dataset", 2020)]);

        let directory_only = resolver
            .resolve(&wanted, &[FactCategory::Directory])
            .await
            .expect("resolve");
        assert!(directory_only.assets.is_empty());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn endpoint_is_normalized() {
        let resolver =
            HttpIdentityResolver::new("https://isaid.example/api/", HttpClientConfig::default())
                .expect("client");
        assert_eq!(resolver.endpoint(), "https://isaid.example/api/resolve");
    }
}
