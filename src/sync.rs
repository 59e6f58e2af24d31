//! Rule sync from the control plane into the routing table.
//!
//! A [`RuleSync`] polls a [`RuleSource`] on a fixed interval and publishes
//! the fetched rules with [`RoutingTable::replace`]. A failed fetch leaves the
//! last published table in place and schedules the next attempt with
//! exponential backoff.

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::RuleSourceSpec;
use crate::metrics::{Metrics, SyncResult};
use crate::router::RoutingTable;
use crate::rules::RoutingRule;
use http::header::ACCEPT;
use http::{Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors from fetching or decoding rules.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode rules: {0}")]
    Decode(String),

    #[error("invalid rule feed url '{0}'")]
    InvalidUrl(String),

    #[error("rule feed request failed: {0}")]
    Http(String),

    #[error("rule feed returned status {0}")]
    Status(u16),

    #[error("rule fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Accepted feed shapes: a bare list, or an object with a `rules` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleFeed {
    List(Vec<RoutingRule>),
    Wrapped { rules: Vec<RoutingRule> },
}

impl RuleFeed {
    fn into_rules(self) -> Vec<RoutingRule> {
        match self {
            RuleFeed::List(rules) | RuleFeed::Wrapped { rules } => rules,
        }
    }
}

fn decode_json(data: &[u8]) -> Result<Vec<RoutingRule>, SyncError> {
    serde_json::from_slice::<RuleFeed>(data)
        .map(RuleFeed::into_rules)
        .map_err(|e| SyncError::Decode(e.to_string()))
}

/// Somewhere routing rules can be fetched from.
pub trait RuleSource: Send + Sync {
    /// Fetches the complete, ordered rule list.
    fn fetch(&self) -> impl Future<Output = Result<Vec<RoutingRule>, SyncError>> + Send;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Rules from a JSON or TOML file, re-read on every fetch.
///
/// TOML files use `[[rules]]` tables; JSON files may hold a bare list.
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn is_toml(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "toml")
    }
}

impl RuleSource for FileRuleSource {
    async fn fetch(&self) -> Result<Vec<RoutingRule>, SyncError> {
        let data = tokio::fs::read(&self.path).await.map_err(|source| SyncError::Io {
            path: self.path.clone(),
            source,
        })?;

        if Self::is_toml(&self.path) {
            let text = std::str::from_utf8(&data).map_err(|e| SyncError::Decode(e.to_string()))?;
            toml::from_str::<RuleFeed>(text)
                .map(RuleFeed::into_rules)
                .map_err(|e| SyncError::Decode(e.to_string()))
        } else {
            decode_json(&data)
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Rules from a control plane JSON feed fetched with GET.
#[derive(Debug, Clone)]
pub struct HttpRuleSource {
    uri: Uri,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpRuleSource {
    pub fn new(url: &str) -> Result<Self, SyncError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| SyncError::InvalidUrl(url.to_string()))?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(SyncError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            uri,
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }
}

impl RuleSource for HttpRuleSource {
    async fn fetch(&self) -> Result<Vec<RoutingRule>, SyncError> {
        let req = Request::get(self.uri.clone())
            .header(ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| SyncError::Http(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| SyncError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status(status.as_u16()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::Http(e.to_string()))?
            .to_bytes();

        decode_json(&body)
    }

    fn describe(&self) -> String {
        self.uri.to_string()
    }
}

/// Either configured source kind.
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    File(FileRuleSource),
    Http(HttpRuleSource),
}

impl ConfiguredSource {
    /// Builds the source named by the configuration.
    pub fn from_spec(spec: &RuleSourceSpec) -> Result<Self, SyncError> {
        match spec {
            RuleSourceSpec::File(path) => Ok(Self::File(FileRuleSource::new(path.clone()))),
            RuleSourceSpec::Http(url) => HttpRuleSource::new(url).map(Self::Http),
        }
    }
}

impl RuleSource for ConfiguredSource {
    async fn fetch(&self) -> Result<Vec<RoutingRule>, SyncError> {
        match self {
            ConfiguredSource::File(source) => source.fetch().await,
            ConfiguredSource::Http(source) => source.fetch().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            ConfiguredSource::File(source) => source.describe(),
            ConfiguredSource::Http(source) => source.describe(),
        }
    }
}

/// Background loop keeping a routing table in step with a rule source.
pub struct RuleSync<S> {
    source: S,
    table: Arc<RoutingTable>,
    interval: Duration,
    timeout: Duration,
    backoff: Backoff,
}

impl<S: RuleSource> RuleSync<S> {
    /// Creates a sync loop. Retry delays never exceed `interval`.
    pub fn new(source: S, table: Arc<RoutingTable>, interval: Duration, timeout: Duration) -> Self {
        let backoff = Backoff::new(BackoffConfig::new().with_max_delay(interval));
        Self {
            source,
            table,
            interval,
            timeout,
            backoff,
        }
    }

    /// Replaces the backoff policy used after failed fetches.
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Backoff::new(config);
        self
    }

    /// Fetches once and publishes the rules if they differ from the current
    /// table.
    pub async fn sync_once(&self) -> Result<SyncResult, SyncError> {
        let fetched = match tokio::time::timeout(self.timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        };

        let rules = match fetched {
            Ok(rules) => rules,
            Err(e) => {
                Metrics::record_sync(SyncResult::Failed);
                return Err(e);
            }
        };

        let result = if self.table.has_rules(&rules) {
            debug!(version = self.table.version(), "rules unchanged");
            SyncResult::Unchanged
        } else {
            self.table.replace(rules);
            SyncResult::Updated
        };
        Metrics::record_sync(result);
        Ok(result)
    }

    /// Polls until shutdown. The first fetch happens one interval after the
    /// call; callers wanting rules at startup run [`sync_once`](Self::sync_once)
    /// first.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            source = %self.source.describe(),
            interval_ms = self.interval.as_millis() as u64,
            "rule sync started"
        );

        let mut delay = self.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("rule sync stopped");
                    return;
                }
            }

            delay = match self.sync_once().await {
                Ok(_) => {
                    self.backoff.reset();
                    self.interval
                }
                Err(e) => {
                    let retry_in = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        failures = self.backoff.failures(),
                        retry_in_ms = retry_in.as_millis() as u64,
                        version = self.table.version(),
                        "rule sync failed, keeping last published table"
                    );
                    retry_in
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source returning scripted results, then repeating the last one.
    struct ScriptedSource {
        results: Mutex<Vec<Result<Vec<RoutingRule>, String>>>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(results: Vec<Result<Vec<RoutingRule>, String>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }
    }

    impl RuleSource for ScriptedSource {
        async fn fetch(&self) -> Result<Vec<RoutingRule>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = {
                let mut results = self.results.lock();
                if results.len() > 1 {
                    results.remove(0)
                } else {
                    results[0].clone()
                }
            };
            next.map_err(SyncError::Http)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn rules_v1() -> Vec<RoutingRule> {
        vec![RoutingRule::new("sandbox-1", "svc-a:8080").with_path_prefix("/api")]
    }

    fn rules_v2() -> Vec<RoutingRule> {
        vec![
            RoutingRule::new("sandbox-1", "svc-a:8080"),
            RoutingRule::new("sandbox-2", "svc-b:8080"),
        ]
    }

    #[tokio::test]
    async fn test_sync_once_updates_only_on_change() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let source = ScriptedSource::new(vec![Ok(rules_v1()), Ok(rules_v1()), Ok(rules_v2())]);
        let sync = RuleSync::new(source, Arc::clone(&table), Duration::from_secs(30), Duration::from_secs(1));

        assert_eq!(sync.sync_once().await.unwrap(), SyncResult::Updated);
        assert_eq!(table.version(), 1);
        assert_eq!(sync.sync_once().await.unwrap(), SyncResult::Unchanged);
        assert_eq!(table.version(), 1);
        assert_eq!(sync.sync_once().await.unwrap(), SyncResult::Updated);
        assert_eq!(table.version(), 2);
        assert_eq!(table.snapshot().rules().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_last_table() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let source = ScriptedSource::new(vec![Ok(rules_v1()), Err("control plane down".to_string())]);
        let sync = RuleSync::new(source, Arc::clone(&table), Duration::from_secs(30), Duration::from_secs(1));

        sync.sync_once().await.unwrap();
        assert!(sync.sync_once().await.is_err());
        assert_eq!(table.version(), 1);
        assert!(table.has_rules(&rules_v1()));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let mut source = ScriptedSource::new(vec![Ok(rules_v1())]);
        source.delay = Duration::from_millis(200);
        let sync = RuleSync::new(source, Arc::clone(&table), Duration::from_secs(30), Duration::from_millis(20));

        assert!(matches!(sync.sync_once().await, Err(SyncError::Timeout(_))));
        assert_eq!(table.version(), 0);
    }

    #[tokio::test]
    async fn test_run_polls_and_stops_on_shutdown() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let source = ScriptedSource::new(vec![Err("flaky".to_string()), Ok(rules_v2())]);
        let calls = Arc::clone(&source.calls);
        let sync = RuleSync::new(source, Arc::clone(&table), Duration::from_millis(20), Duration::from_secs(1))
            .with_backoff(
                BackoffConfig::new()
                    .with_base_delay(Duration::from_millis(5))
                    .with_max_delay(Duration::from_millis(20))
                    .with_jitter(false),
            );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(sync.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(table.version(), 1);
        assert!(table.has_rules(&rules_v2()));
    }

    #[tokio::test]
    async fn test_file_source_json_list() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"[{{"routeKey":"sandbox-1","targetService":"svc-a:8080","pathPrefixes":["/api"]}}]"#
        )
        .unwrap();

        let rules = FileRuleSource::new(file.path()).fetch().await.unwrap();
        assert_eq!(rules, rules_v1());
    }

    #[tokio::test]
    async fn test_file_source_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[rules]]
routeKey = "sandbox-1"
targetService = "svc-a:8080"

[rules.additionalHeaders]
x-sandbox = "sandbox-1"

[[rules]]
routeKey = "sandbox-2"
targetService = "svc-b:8080"
"#
        )
        .unwrap();

        let rules = FileRuleSource::new(file.path()).fetch().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].additional_headers.get("x-sandbox").map(String::as_str),
            Some("sandbox-1")
        );
        assert_eq!(rules[1].target_service, "svc-b:8080");
    }

    #[tokio::test]
    async fn test_file_source_errors() {
        let missing = FileRuleSource::new("/definitely/not/here.json");
        assert!(matches!(missing.fetch().await, Err(SyncError::Io { .. })));

        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"routes": []}}"#).unwrap();
        let garbage = FileRuleSource::new(file.path());
        assert!(matches!(garbage.fetch().await, Err(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn test_http_source_rejects_bad_urls() {
        assert!(HttpRuleSource::new("not a url").is_err());
        assert!(HttpRuleSource::new("https://control-plane/rules").is_err());
        assert!(HttpRuleSource::new("http://control-plane:8080/rules").is_ok());
    }

    #[test]
    fn test_configured_source_from_spec() {
        let spec = RuleSourceSpec::File(PathBuf::from("rules.toml"));
        let source = ConfiguredSource::from_spec(&spec).unwrap();
        assert_eq!(source.describe(), "file:rules.toml");
    }
}
