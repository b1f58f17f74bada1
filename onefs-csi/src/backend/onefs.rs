//! OneFS platform API client.
//!
//! Maps the [`StorageBackend`] primitives onto the cluster's REST endpoints:
//! - `/namespace/...` for directories and server-side copies
//! - `/platform/1/quota/quotas` for directory quotas
//! - `/platform/2/protocols/nfs/exports` for exports (zone scoped)
//! - `/platform/1/snapshot/snapshots` for snapshots
//! - `/platform/1/statistics/current` for free space

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    BackendConnector, BackendError, ClusterInfo, Export, ExportPage, Quota, Result, Snapshot,
    StorageBackend, validate_quota_size,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header selecting the object type on namespace PUT requests.
const TARGET_TYPE_HEADER: &str = "x-isi-ifs-target-type";
/// Header carrying the source of a server-side copy.
const COPY_SOURCE_HEADER: &str = "x-isi-ifs-copy-source";
const ACCESS_CONTROL_HEADER: &str = "x-isi-ifs-access-control";

/// Connection settings for the cluster.
#[derive(Clone)]
pub struct OneFsSettings {
    /// Base URL, e.g. `https://10.0.0.1:8080`
    pub endpoint: String,
    pub user: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Zone used for export listings
    pub default_zone: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for OneFsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneFsSettings")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("default_zone", &self.default_zone)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize, Default)]
struct ClusterConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    onefs_version: OneFsVersion,
}

#[derive(Debug, Deserialize, Default)]
struct OneFsVersion {
    #[serde(default)]
    release: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct QuotaThresholds {
    hard: i64,
}

#[derive(Debug, Serialize)]
struct CreateQuotaBody<'a> {
    path: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    include_snapshots: bool,
    thresholds_include_overhead: bool,
    container: bool,
    enforced: bool,
    thresholds: QuotaThresholds,
}

#[derive(Debug, Deserialize)]
struct CreatedId<T> {
    id: T,
}

#[derive(Debug, Deserialize)]
struct QuotaList {
    #[serde(default)]
    quotas: Vec<QuotaItem>,
}

#[derive(Debug, Deserialize)]
struct QuotaItem {
    id: String,
    path: String,
    #[serde(default)]
    enforced: bool,
    #[serde(default)]
    thresholds: QuotaItemThresholds,
}

#[derive(Debug, Deserialize, Default)]
struct QuotaItemThresholds {
    hard: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExportList {
    #[serde(default)]
    exports: Vec<ExportItem>,
    #[serde(default)]
    resume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportItem {
    id: u32,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    zone: String,
}

#[derive(Debug, Serialize)]
struct CreateExportBody<'a> {
    paths: [&'a str; 1],
}

#[derive(Debug, Serialize)]
struct CreateSnapshotBody<'a> {
    name: &'a str,
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct SnapshotList {
    #[serde(default)]
    snapshots: Vec<SnapshotItem>,
}

#[derive(Debug, Deserialize)]
struct SnapshotItem {
    id: u64,
    name: String,
    path: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    created: i64,
}

#[derive(Debug, Deserialize)]
struct StatList {
    #[serde(default)]
    stats: Vec<StatItem>,
}

#[derive(Debug, Deserialize)]
struct StatItem {
    key: String,
    value: serde_json::Value,
}

impl From<ExportItem> for Export {
    fn from(item: ExportItem) -> Self {
        Export {
            id: item.id,
            paths: item.paths,
            zone: item.zone,
        }
    }
}

impl From<QuotaItem> for Quota {
    fn from(item: QuotaItem) -> Self {
        Quota {
            id: item.id,
            path: item.path,
            size_bytes: item.thresholds.hard.unwrap_or(0),
            enforced: item.enforced,
        }
    }
}

impl From<SnapshotItem> for Snapshot {
    fn from(item: SnapshotItem) -> Self {
        Snapshot {
            id: item.id,
            name: item.name,
            path: item.path,
            size_bytes: item.size,
            created: item.created,
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Classify a failed HTTP exchange. `what` names the object for NotFound and
/// AlreadyExists messages.
fn classify(status: StatusCode, what: &str, message: String) -> BackendError {
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(what.to_string()),
        StatusCode::CONFLICT => BackendError::AlreadyExists(what.to_string()),
        StatusCode::BAD_REQUEST => BackendError::InvalidArgument(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Unavailable(message)
        }
        _ => BackendError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    BackendError::Unavailable(err.to_string())
}

fn malformed(err: reqwest::Error) -> BackendError {
    BackendError::Malformed(err.to_string())
}

/// Path segments of a snapshotted directory inside the `.snapshot` tree.
fn snapshot_source(snapshot: &Snapshot) -> Vec<&str> {
    let relative = snapshot.path.strip_prefix("/ifs").unwrap_or(&snapshot.path);
    let mut segments = vec!["ifs", ".snapshot", snapshot.name.as_str()];
    segments.extend(path_segments(relative));
    segments
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Authenticated client for one cluster.
#[derive(Debug, Clone)]
pub struct OneFsClient {
    http: Client,
    settings: OneFsSettings,
}

impl OneFsClient {
    pub fn new(settings: OneFsSettings) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(settings.insecure)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.request_timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self { http, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.endpoint.trim_end_matches('/'), path)
    }

    /// `prefix` followed by `segments`, each percent-encoded as a single
    /// path segment.
    fn encoded_url<'a>(
        &self,
        prefix: &str,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url> {
        let mut url = Url::parse(&self.url(prefix)).map_err(|e| {
            BackendError::InvalidArgument(format!(
                "endpoint {}: {}",
                self.settings.endpoint, e
            ))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::InvalidArgument(format!(
                    "endpoint {} cannot carry a path",
                    self.settings.endpoint
                ))
            })?
            .extend(segments);
        Ok(url)
    }

    fn namespace_url(&self, path: &str) -> Result<Url> {
        self.encoded_url("/namespace", path_segments(path))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.request_url(method, self.url(path))
    }

    fn request_url(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.settings.user, Some(&self.settings.password))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ApiErrors>().await {
            Ok(body) if !body.errors.is_empty() => body
                .errors
                .iter()
                .map(|e| format!("{} {}", e.code, e.message).trim().to_string())
                .collect::<Vec<_>>()
                .join("; "),
            _ => status.to_string(),
        };
        debug!(status = %status, what = %what, message = %message, "OneFS request failed");
        Err(classify(status, what, message))
    }

    async fn export_list(&self, request: RequestBuilder, what: &str) -> Result<ExportList> {
        self.send(request, what)
            .await?
            .json::<ExportList>()
            .await
            .map_err(malformed)
    }

    async fn snapshot_lookup(&self, key: &str) -> Result<Snapshot> {
        let what = format!("snapshot {}", key);
        let url = self.encoded_url("/platform/1/snapshot/snapshots", [key])?;
        let list = self
            .send(self.request_url(Method::GET, url), &what)
            .await?
            .json::<SnapshotList>()
            .await
            .map_err(malformed)?;
        list.snapshots
            .into_iter()
            .next()
            .map(Snapshot::from)
            .ok_or(BackendError::NotFound(what))
    }
}

#[async_trait]
impl StorageBackend for OneFsClient {
    async fn ping(&self) -> Result<ClusterInfo> {
        let config = self
            .send(
                self.request(Method::GET, "/platform/1/cluster/config"),
                "cluster config",
            )
            .await?
            .json::<ClusterConfig>()
            .await
            .map_err(malformed)?;
        Ok(ClusterInfo {
            name: config.name,
            version: config.onefs_version.release,
        })
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let request = self
            .request_url(Method::PUT, self.namespace_url(path)?)
            .query(&[("recursive", "true")])
            .header(TARGET_TYPE_HEADER, "container")
            .header(ACCESS_CONTROL_HEADER, "0777");
        self.send(request, &format!("directory {}", path)).await?;
        Ok(())
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        let request = self.request_url(Method::HEAD, self.namespace_url(path)?);
        match self.send(request, &format!("directory {}", path)).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        let request = self
            .request_url(Method::DELETE, self.namespace_url(path)?)
            .query(&[("recursive", "true")]);
        self.send(request, &format!("directory {}", path)).await?;
        Ok(())
    }

    async fn copy_directory(&self, src: &str, dst: &str) -> Result<()> {
        let request = self
            .request_url(Method::PUT, self.namespace_url(dst)?)
            .header(COPY_SOURCE_HEADER, self.namespace_url(src)?.path());
        self.send(request, &format!("directory {}", src)).await?;
        Ok(())
    }

    async fn copy_snapshot(&self, snapshot: &Snapshot, dst: &str) -> Result<()> {
        let source = self.encoded_url("/namespace", snapshot_source(snapshot))?;
        let request = self
            .request_url(Method::PUT, self.namespace_url(dst)?)
            .header(COPY_SOURCE_HEADER, source.path());
        self.send(request, &format!("snapshot {}", snapshot.name))
            .await?;
        Ok(())
    }

    async fn create_quota(
        &self,
        path: &str,
        name: &str,
        size_bytes: i64,
        enable_threshold: bool,
    ) -> Result<String> {
        validate_quota_size(size_bytes)?;
        let body = CreateQuotaBody {
            path,
            kind: "directory",
            include_snapshots: false,
            thresholds_include_overhead: false,
            container: true,
            enforced: enable_threshold,
            thresholds: QuotaThresholds { hard: size_bytes },
        };
        let created = self
            .send(
                self.request(Method::POST, "/platform/1/quota/quotas")
                    .json(&body),
                &format!("quota on {}", path),
            )
            .await?
            .json::<CreatedId<String>>()
            .await
            .map_err(malformed)?;
        debug!(path = %path, name = %name, quota_id = %created.id, "Quota created");
        Ok(created.id)
    }

    async fn get_quota_by_path(&self, path: &str) -> Result<Quota> {
        let what = format!("quota on {}", path);
        let list = self
            .send(
                self.request(Method::GET, "/platform/1/quota/quotas")
                    .query(&[("path", path), ("type", "directory")]),
                &what,
            )
            .await?
            .json::<QuotaList>()
            .await
            .map_err(malformed)?;
        list.quotas
            .into_iter()
            .find(|q| q.path == path)
            .map(Quota::from)
            .ok_or(BackendError::NotFound(what))
    }

    async fn delete_quota_by_export_id_with_zone(
        &self,
        name: &str,
        export_id: u32,
        zone: &str,
    ) -> Result<()> {
        let export = self.get_export_by_id_with_zone(export_id, zone).await?;
        let path = export
            .path()
            .ok_or_else(|| BackendError::Malformed(format!("export {} has no paths", export_id)))?;
        let quota = self.get_quota_by_path(path).await?;
        self.send(
            self.request(
                Method::DELETE,
                &format!("/platform/1/quota/quotas/{}", quota.id),
            ),
            &format!("quota for volume {}", name),
        )
        .await?;
        Ok(())
    }

    async fn get_exports(&self) -> Result<Vec<Export>> {
        let mut exports = Vec::new();
        let mut token = String::new();
        loop {
            let page = self.get_exports_with_limit(0, &token).await?;
            exports.extend(page.exports);
            if page.next_token.is_empty() {
                return Ok(exports);
            }
            token = page.next_token;
        }
    }

    async fn get_exports_with_limit(&self, limit: u32, token: &str) -> Result<ExportPage> {
        let mut request = self.request(Method::GET, "/platform/2/protocols/nfs/exports");
        if token.is_empty() {
            request = request.query(&[("zone", self.settings.default_zone.as_str())]);
            if limit > 0 {
                request = request.query(&[("limit", limit)]);
            }
        } else {
            // A resumed listing carries every other parameter inside the token.
            request = request.query(&[("resume", token)]);
        }

        let list = match self.export_list(request, "exports").await {
            Err(BackendError::InvalidArgument(_) | BackendError::NotFound(_))
                if !token.is_empty() =>
            {
                return Err(BackendError::InvalidToken(token.to_string()));
            }
            other => other?,
        };
        Ok(ExportPage {
            exports: list.exports.into_iter().map(Export::from).collect(),
            next_token: list.resume.unwrap_or_default(),
        })
    }

    async fn get_export_by_id_with_zone(&self, id: u32, zone: &str) -> Result<Export> {
        let what = format!("export {} in zone {}", id, zone);
        let request = self
            .request(
                Method::GET,
                &format!("/platform/2/protocols/nfs/exports/{}", id),
            )
            .query(&[("zone", zone)]);
        let list = self.export_list(request, &what).await?;
        list.exports
            .into_iter()
            .next()
            .map(Export::from)
            .ok_or(BackendError::NotFound(what))
    }

    async fn get_export_by_path_with_zone(&self, path: &str, zone: &str) -> Result<Export> {
        let what = format!("export of {} in zone {}", path, zone);
        let request = self
            .request(Method::GET, "/platform/2/protocols/nfs/exports")
            .query(&[("zone", zone), ("path", path)]);
        let list = self.export_list(request, &what).await?;
        list.exports
            .into_iter()
            .find(|e| e.paths.iter().any(|p| p == path))
            .map(Export::from)
            .ok_or(BackendError::NotFound(what))
    }

    async fn create_export(&self, path: &str, zone: &str) -> Result<u32> {
        let created = self
            .send(
                self.request(Method::POST, "/platform/2/protocols/nfs/exports")
                    .query(&[("zone", zone)])
                    .json(&CreateExportBody { paths: [path] }),
                &format!("export of {} in zone {}", path, zone),
            )
            .await?
            .json::<CreatedId<u32>>()
            .await
            .map_err(malformed)?;
        Ok(created.id)
    }

    async fn delete_export(&self, id: u32, zone: &str) -> Result<()> {
        self.send(
            self.request(
                Method::DELETE,
                &format!("/platform/2/protocols/nfs/exports/{}", id),
            )
            .query(&[("zone", zone)]),
            &format!("export {} in zone {}", id, zone),
        )
        .await?;
        Ok(())
    }

    async fn create_snapshot(&self, path: &str, name: &str) -> Result<Snapshot> {
        let item = self
            .send(
                self.request(Method::POST, "/platform/1/snapshot/snapshots")
                    .json(&CreateSnapshotBody { name, path }),
                &format!("snapshot {}", name),
            )
            .await?
            .json::<SnapshotItem>()
            .await
            .map_err(malformed)?;
        Ok(item.into())
    }

    async fn get_snapshot(&self, id: u64) -> Result<Snapshot> {
        self.snapshot_lookup(&id.to_string()).await
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot> {
        self.snapshot_lookup(name).await
    }

    async fn delete_snapshot(&self, id: u64) -> Result<()> {
        self.send(
            self.request(
                Method::DELETE,
                &format!("/platform/1/snapshot/snapshots/{}", id),
            ),
            &format!("snapshot {}", id),
        )
        .await?;
        Ok(())
    }

    async fn available_capacity(&self) -> Result<i64> {
        let stats = self
            .send(
                self.request(Method::GET, "/platform/1/statistics/current")
                    .query(&[("key", "ifs.bytes.avail"), ("devid", "all")]),
                "statistics",
            )
            .await?
            .json::<StatList>()
            .await
            .map_err(malformed)?;
        stats
            .stats
            .iter()
            .find(|s| s.key == "ifs.bytes.avail")
            .and_then(|s| s.value.as_i64())
            .ok_or_else(|| BackendError::Malformed("ifs.bytes.avail missing from statistics".into()))
    }
}

/// Builds a [`OneFsClient`] and verifies it against the cluster.
#[derive(Debug, Clone)]
pub struct OneFsConnector {
    settings: OneFsSettings,
}

impl OneFsConnector {
    pub fn new(settings: OneFsSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BackendConnector for OneFsConnector {
    async fn connect(&self) -> Result<Arc<dyn StorageBackend>> {
        if self.settings.user.is_empty() {
            return Err(BackendError::InvalidArgument("no OneFS user configured".into()));
        }
        if self.settings.password.is_empty() {
            return Err(BackendError::InvalidArgument(
                "no OneFS password configured".into(),
            ));
        }

        let client = OneFsClient::new(self.settings.clone())?;
        let info = client.ping().await.inspect_err(|e| {
            warn!(endpoint = %self.settings.endpoint, error = %e, "OneFS ping failed");
        })?;
        debug!(cluster = %info.name, version = %info.version, "Connected to OneFS");
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OneFsSettings {
        OneFsSettings {
            endpoint: "https://127.0.0.1:8080/".into(),
            user: "admin".into(),
            password: "secret".into(),
            insecure: true,
            default_zone: "System".into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_classify_status() {
        assert!(classify(StatusCode::NOT_FOUND, "export 1", String::new()).is_not_found());
        assert!(matches!(
            classify(StatusCode::CONFLICT, "quota", String::new()),
            BackendError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "x", "bad".into()),
            BackendError::InvalidArgument(m) if m == "bad"
        ));
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "x", String::new()).is_unavailable());
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, "x", "denied".into()),
            BackendError::Api { status: 401, .. }
        ));
    }

    #[test]
    fn test_snapshot_source_path() {
        let snap = Snapshot {
            id: 4,
            name: "snap-1".into(),
            path: "/ifs/data/csi/volume1".into(),
            size_bytes: 0,
            created: 0,
        };
        let client = OneFsClient::new(settings()).unwrap();
        let url = client
            .encoded_url("/namespace", snapshot_source(&snap))
            .unwrap();
        assert_eq!(url.path(), "/namespace/ifs/.snapshot/snap-1/data/csi/volume1");
    }

    #[test]
    fn test_namespace_url_encodes_segments() {
        let client = OneFsClient::new(settings()).unwrap();
        assert_eq!(
            client.namespace_url("/ifs/data/csi/v1").unwrap().as_str(),
            "https://127.0.0.1:8080/namespace/ifs/data/csi/v1"
        );

        let url = client.namespace_url("/ifs/data/csi/a b?c#d%").unwrap();
        assert_eq!(url.path(), "/namespace/ifs/data/csi/a%20b%3Fc%23d%25");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());

        // A snapshot name is always a single segment
        let url = client
            .encoded_url("/platform/1/snapshot/snapshots", ["x/../y"])
            .unwrap();
        assert_eq!(url.path(), "/platform/1/snapshot/snapshots/x%2F..%2Fy");
    }

    #[test]
    fn test_url_joins_endpoint() {
        let client = OneFsClient::new(settings()).unwrap();
        assert_eq!(
            client.url("/platform/1/cluster/config"),
            "https://127.0.0.1:8080/platform/1/cluster/config"
        );
    }

    #[test]
    fn test_settings_debug_redacts_password() {
        let rendered = format!("{:?}", settings());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_quota_item_conversion() {
        let json = r#"{"quotas":[{"id":"AABpAQEA","path":"/ifs/data/csi/v1","enforced":true,
            "thresholds":{"hard":8589934592,"soft":null}}]}"#;
        let list: QuotaList = serde_json::from_str(json).unwrap();
        let quota = Quota::from(list.quotas.into_iter().next().unwrap());
        assert_eq!(quota.size_bytes, 8 * 1024 * 1024 * 1024);
        assert!(quota.enforced);
    }

    #[test]
    fn test_export_list_parsing() {
        let json = r#"{"exports":[{"id":19,"paths":["/ifs/data/csi/volume1"],"zone":"System"}],
            "resume":"abc","total":3}"#;
        let list: ExportList = serde_json::from_str(json).unwrap();
        assert_eq!(list.resume.as_deref(), Some("abc"));
        let export = Export::from(list.exports.into_iter().next().unwrap());
        assert_eq!(export.id, 19);
        assert_eq!(export.path(), Some("/ifs/data/csi/volume1"));
    }

    #[tokio::test]
    async fn test_connector_rejects_empty_password() {
        let mut s = settings();
        s.password = String::new();
        let err = OneFsConnector::new(s).connect().await.err().unwrap();
        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }
}
