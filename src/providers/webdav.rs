//! WebDAV Cloud Adapter
//!
//! Implementation of the BackendAdapter trait for Nextcloud and ownCloud
//! instances. Paths are addressed relative to the per-user DAV root
//! (`/remote.php/dav/files/<user>/`).
//!
//! WebDAV extends HTTP with PROPFIND and MKCOL; listings come back as a
//! `207 Multi-Status` XML document which is parsed with a few tolerant
//! regular expressions, since servers disagree on namespace prefixes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, TryStreamExt};
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    invalidate_on_connection_error, BackendAdapter, BackendId, BackendKind, ByteSink,
    ByteStream, CloudTarget, ConnectionSettings, Credentials, Entry, EntryKind, RemoteRef,
    SessionSlot, StorageQuota, VaultError,
};
use crate::path_model::{finalize_listing, RemotePath};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:resourcetype/>
        <d:getcontentlength/>
        <d:getlastmodified/>
        <d:getetag/>
    </d:prop>
</d:propfind>"#;

/// Translate an HTTP status into the vault taxonomy
pub fn map_http_status(status: StatusCode, context: &str) -> VaultError {
    let msg = format!("{} returned {}", context, status);
    match status.as_u16() {
        404 | 409 | 410 => VaultError::NotFound(msg),
        401 | 403 => VaultError::PermissionDenied(msg),
        413 | 507 => VaultError::QuotaExceeded(msg),
        _ => VaultError::ConnectionError(msg),
    }
}

fn transport(e: reqwest::Error) -> VaultError {
    if e.is_timeout() {
        VaultError::ConnectionError(format!("request timed out: {}", e))
    } else {
        VaultError::ConnectionError(e.to_string())
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// One `<response>` element of a multistatus document
#[derive(Debug, Clone, PartialEq)]
struct DavResource {
    href: String,
    is_collection: bool,
    size: Option<u64>,
    modified: Option<DateTime<Utc>>,
}

/// Regexes for the handful of DAV properties we read, compiled once
struct MultistatusParser {
    response: Regex,
    href: Regex,
    resourcetype: Regex,
    content_length: Regex,
    last_modified: Regex,
}

impl MultistatusParser {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            response: tag_regex("response")?,
            href: tag_regex("href")?,
            resourcetype: tag_regex("resourcetype")?,
            content_length: tag_regex("getcontentlength")?,
            last_modified: tag_regex("getlastmodified")?,
        })
    }

    fn parse(&self, xml: &str) -> Vec<DavResource> {
        let mut out = Vec::new();
        for cap in self.response.captures_iter(xml) {
            let Some(content) = cap.get(1).map(|m| m.as_str()) else {
                continue;
            };
            let Some(href) = first(&self.href, content) else {
                tracing::warn!("[WebDAV] No href found in response element");
                continue;
            };
            let lower = content.to_lowercase();
            let is_collection = first(&self.resourcetype, content)
                .map(|rt| rt.to_lowercase().contains("collection"))
                .unwrap_or(false)
                || lower.contains("iscollection>1</");
            out.push(DavResource {
                href: unescape_xml(&href),
                is_collection,
                size: first(&self.content_length, content).and_then(|s| s.parse().ok()),
                modified: first(&self.last_modified, content).and_then(|s| {
                    DateTime::parse_from_rfc2822(&s)
                        .map(|d| d.with_timezone(&Utc))
                        .ok()
                }),
            });
        }
        out
    }
}

fn tag_regex(tag: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?s)<(?:[A-Za-z][A-Za-z0-9_]*:)?{tag}(?:\s[^>]*)?>(.*?)</(?:[A-Za-z][A-Za-z0-9_]*:)?{tag}>"
    ))
}

fn first(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Split a URL path into percent-decoded segments
fn decoded_segments(raw_path: &str) -> Vec<String> {
    raw_path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .collect()
}

/// OCS reply wrapper: `{"ocs": {"meta": {...}, "data": ...}}`
#[derive(Debug, Deserialize)]
struct OcsEnvelope {
    ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
struct OcsBody {
    meta: OcsMeta,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OcsMeta {
    statuscode: u32,
    #[serde(default)]
    message: Option<String>,
}

impl OcsMeta {
    /// v1 endpoints answer HTTP 200 and put the real outcome here
    fn check(&self, context: &str) -> Result<(), VaultError> {
        let msg = || {
            format!(
                "{} returned OCS status {}: {}",
                context,
                self.statuscode,
                self.message.as_deref().unwrap_or("")
            )
        };
        match self.statuscode {
            100 | 200 => Ok(()),
            401 | 997 => Err(VaultError::PermissionDenied(msg())),
            404 | 998 => Err(VaultError::NotFound(msg())),
            _ => Err(VaultError::ConnectionError(msg())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OcsUser {
    #[serde(default)]
    quota: OcsQuota,
}

/// Negative numbers mean "not computed" or "unlimited"
#[derive(Debug, Default, Deserialize)]
struct OcsQuota {
    used: Option<f64>,
    free: Option<f64>,
    total: Option<f64>,
}

fn non_negative(n: Option<f64>) -> Option<u64> {
    n.filter(|v| *v >= 0.0).map(|v| v as u64)
}

impl From<OcsQuota> for StorageQuota {
    fn from(q: OcsQuota) -> Self {
        StorageQuota {
            used: non_negative(q.used).unwrap_or(0),
            free: non_negative(q.free),
            total: non_negative(q.total),
        }
    }
}

/// Server version and enabled features, from the OCS capabilities endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub version: Option<ServerVersion>,
    /// Per-app capability objects keyed by app name (`files`, `dav`, ...)
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerVersion {
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    #[serde(default)]
    pub micro: u32,
    #[serde(default)]
    pub string: String,
}

impl ServerCapabilities {
    pub fn has(&self, app: &str) -> bool {
        self.capabilities.get(app).is_some()
    }
}

/// WebDAV Cloud Adapter
pub struct WebDavAdapter {
    target: CloudTarget,
    id: BackendId,
    /// Decoded path segments of the DAV root, stripped from every href
    root_segments: Vec<String>,
    client: Arc<SessionSlot<Client>>,
    settings: ConnectionSettings,
    parser: MultistatusParser,
    propfind: Method,
    mkcol: Method,
}

impl WebDavAdapter {
    pub fn new(target: CloudTarget, settings: ConnectionSettings) -> Result<Self, VaultError> {
        let base = url::Url::parse(target.base_url())
            .map_err(|e| VaultError::InvalidConfig(format!("cloud base_url: {}", e)))?;
        let parser = MultistatusParser::new()
            .map_err(|e| VaultError::InvalidConfig(format!("multistatus parser: {}", e)))?;
        let method = |name: &str| {
            Method::from_bytes(name.as_bytes())
                .map_err(|e| VaultError::InvalidConfig(format!("{}: {}", name, e)))
        };
        Ok(Self {
            id: target.id(),
            root_segments: decoded_segments(base.path()),
            target,
            client: Arc::new(SessionSlot::new()),
            settings,
            parser,
            propfind: method("PROPFIND")?,
            mkcol: method("MKCOL")?,
        })
    }

    fn client(&self) -> Result<Arc<Client>, VaultError> {
        if let Some(client) = self.client.current() {
            return Ok(client);
        }
        tracing::info!("[WebDAV] Opening session to {}", self.target.base_url());
        let client = Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .read_timeout(self.settings.read_write_timeout)
            .build()
            .map_err(|e| VaultError::ConnectionError(format!("HTTP client: {}", e)))?;
        let client = Arc::new(client);
        self.client.store(client.clone());
        Ok(client)
    }

    /// Build full URL for a path; collections get a trailing slash
    fn url_for(&self, path: &RemotePath, collection: bool) -> String {
        let mut url = self.target.base_url().to_string();
        let encoded: Vec<String> = path
            .segments()
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        url.push_str(&encoded.join("/"));
        if collection && !path.is_root() {
            url.push('/');
        }
        url
    }

    fn request(&self, client: &Client, method: Method, url: &str) -> RequestBuilder {
        let rb = client.request(method, url);
        match &self.target.credentials {
            Credentials::Password { username, password } => {
                rb.basic_auth(username, Some(password.expose_secret()))
            }
            Credentials::Token { token, .. } => rb.bearer_auth(token.expose_secret()),
            Credentials::Anonymous => rb,
        }
    }

    fn fail(&self, err: VaultError) -> VaultError {
        self.client.check(err)
    }

    async fn propfind(&self, url: &str, depth: &str) -> Result<Vec<DavResource>, VaultError> {
        let client = self.client()?;
        tracing::debug!("[WebDAV] PROPFIND {} (depth {})", url, depth);
        let response = self
            .request(&client, self.propfind.clone(), url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| self.fail(transport(e)))?;

        let status = response.status();
        if status != StatusCode::MULTI_STATUS && status != StatusCode::OK {
            tracing::debug!("[WebDAV] PROPFIND {} failed: {}", url, status);
            return Err(self.fail(map_http_status(status, "PROPFIND")));
        }
        let xml = response.text().await.map_err(|e| self.fail(transport(e)))?;
        let resources = self.parser.parse(&xml);
        tracing::debug!("[WebDAV] Found {} response elements", resources.len());
        Ok(resources)
    }

    /// Segments of `href` below the DAV root, or `None` if it lies elsewhere
    fn relative_segments(&self, href: &str) -> Option<Vec<String>> {
        let raw_path = if href.starts_with("http://") || href.starts_with("https://") {
            url::Url::parse(href).ok()?.path().to_string()
        } else {
            href.to_string()
        };
        let segments = decoded_segments(&raw_path);
        segments
            .strip_prefix(self.root_segments.as_slice())
            .map(<[String]>::to_vec)
    }

    async fn make_collection(&self, client: &Client, path: &RemotePath) -> Result<(), VaultError> {
        let url = self.url_for(path, true);
        let response = self
            .request(client, self.mkcol.clone(), &url)
            .send()
            .await
            .map_err(|e| self.fail(transport(e)))?;
        match response.status() {
            StatusCode::CREATED => {
                tracing::debug!("[WebDAV] Created collection {}", url);
                Ok(())
            }
            // 405: already exists
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(self.fail(map_http_status(status, "MKCOL"))),
        }
    }

    /// OCS endpoints live beside the DAV root, under the server origin
    fn ocs_url(&self, endpoint: &str) -> String {
        let base = self.target.base_url();
        let server = match base.find("/remote.php/") {
            Some(i) => &base[..i],
            None => base.trim_end_matches('/'),
        };
        format!("{}/ocs/v1.php/cloud/{}?format=json", server, endpoint)
    }

    async fn ocs_get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, VaultError> {
        let client = self.client()?;
        let url = self.ocs_url(endpoint);
        tracing::debug!("[WebDAV] OCS GET {}", url);
        let response = self
            .request(&client, Method::GET, &url)
            .header("OCS-APIRequest", "true")
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.fail(transport(e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.fail(map_http_status(status, "OCS")));
        }
        let envelope: OcsEnvelope = response
            .json()
            .await
            .map_err(|e| VaultError::ConnectionError(format!("malformed OCS reply from {}: {}", url, e)))?;
        envelope.ocs.meta.check(endpoint)?;
        serde_json::from_value(envelope.ocs.data)
            .map_err(|e| VaultError::ConnectionError(format!("unexpected OCS data from {}: {}", url, e)))
    }

    /// Version and enabled apps of the Nextcloud/ownCloud server
    pub async fn capabilities(&self) -> Result<ServerCapabilities, VaultError> {
        self.ocs_get("capabilities").await
    }
}

#[async_trait]
impl BackendAdapter for WebDavAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn display_name(&self) -> String {
        let host = url::Url::parse(self.target.base_url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.target.base_url().to_string());
        match self.target.credentials.username() {
            Some(user) => format!("{}@{}", user, host),
            None => host,
        }
    }

    async fn list_directory(&self, path: &RemotePath) -> Result<Vec<Entry>, VaultError> {
        let url = self.url_for(path, true);
        let resources = self.propfind(&url, "1").await?;
        let parent = RemoteRef::new(self.id.clone(), path.clone());

        let mut entries = Vec::with_capacity(resources.len());
        for res in resources {
            let Some(rel) = self.relative_segments(&res.href) else {
                tracing::debug!("[WebDAV] Ignoring href outside DAV root: {}", res.href);
                continue;
            };
            if rel.as_slice() == path.segments() {
                tracing::debug!("[WebDAV] Skipping self-reference: {}", res.href);
                continue;
            }
            let name = match rel.split_last() {
                Some((name, dir)) if dir == path.segments() => name,
                _ => {
                    tracing::debug!("[WebDAV] Ignoring non-child href: {}", res.href);
                    continue;
                }
            };
            let kind = if res.is_collection || res.href.ends_with('/') {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            match Entry::child(&parent, name, kind, res.size, res.modified) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("[WebDAV] Skipping entry {:?}: {}", name, e),
            }
        }
        let entries = finalize_listing(entries);
        tracing::debug!("[WebDAV] Parsed {} entries", entries.len());
        Ok(entries)
    }

    async fn open_for_read(&self, remote_ref: &RemoteRef) -> Result<ByteStream, VaultError> {
        let client = self.client()?;
        let url = self.url_for(&remote_ref.path, false);
        tracing::debug!("[WebDAV] GET {}", url);
        let response = self
            .request(&client, Method::GET, &url)
            .send()
            .await
            .map_err(|e| self.fail(transport(e)))?;
        if !response.status().is_success() {
            return Err(self.fail(map_http_status(response.status(), "GET")));
        }
        let body = response.bytes_stream().map_err(transport);
        Ok(invalidate_on_connection_error(Box::pin(body), self.client.clone()))
    }

    async fn open_for_write(
        &self,
        path: &RemotePath,
        expected_size: Option<u64>,
    ) -> Result<Box<dyn ByteSink>, VaultError> {
        if path.is_root() {
            return Err(VaultError::InvalidName("cannot write to the DAV root".to_string()));
        }
        let client = self.client()?;
        if let Some(parent) = path.parent() {
            let mut current = RemotePath::root(parent.flavor());
            for segment in parent.segments() {
                current = current.join(segment)?;
                self.make_collection(&client, &current).await?;
            }
        }

        let url = self.url_for(path, false);
        tracing::debug!("[WebDAV] PUT {} ({:?} bytes)", url, expected_size);
        let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(2);
        let body = stream::poll_fn(move |cx| rx.poll_recv(cx));
        let mut request = self
            .request(&client, Method::PUT, &url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body));
        if let Some(size) = expected_size {
            request = request.header(CONTENT_LENGTH, size);
        }
        let task = tokio::spawn(async move { request.send().await });

        Ok(Box::new(WebDavSink {
            tx: Some(tx),
            task: Some(task),
            pending: None,
            slot: self.client.clone(),
        }))
    }

    async fn stat_entry(&self, remote_ref: &RemoteRef) -> Result<Entry, VaultError> {
        if remote_ref.path.is_root() {
            return Err(VaultError::InvalidName("backend root has no entry".to_string()));
        }
        let url = self.url_for(&remote_ref.path, false);
        let resources = self.propfind(&url, "0").await?;
        let res = resources
            .into_iter()
            .next()
            .ok_or_else(|| VaultError::NotFound(format!("no PROPFIND response for {}", url)))?;
        let kind = if res.is_collection {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Entry::at(remote_ref.clone(), kind, res.size, res.modified)
    }

    async fn quota(&self) -> Result<Option<StorageQuota>, VaultError> {
        let Some(username) = self.target.credentials.username() else {
            return Ok(None);
        };
        let endpoint = format!("users/{}", urlencoding::encode(username));
        let user: OcsUser = self.ocs_get(&endpoint).await?;
        let quota = StorageQuota::from(user.quota);
        tracing::debug!("[WebDAV] Quota for {}: {:?}", username, quota);
        Ok(Some(quota))
    }

    fn invalidate_session(&self) {
        tracing::debug!("[WebDAV] Dropping session for {}", self.target.base_url());
        self.client.invalidate();
    }
}

/// Streams an upload into a PUT request running on its own task.
///
/// The latest chunk is held back until the next write or `commit`, so the
/// request body cannot complete before the caller commits.
struct WebDavSink {
    tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    task: Option<JoinHandle<Result<Response, reqwest::Error>>>,
    pending: Option<Bytes>,
    slot: Arc<SessionSlot<Client>>,
}

impl WebDavSink {
    async fn send(&mut self, chunk: Bytes) -> Result<(), VaultError> {
        let sent = match &self.tx {
            Some(tx) => tx.send(Ok(chunk)).await.is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        // The request ended early; its outcome explains why
        self.tx = None;
        match self.finish().await {
            Ok(()) => Err(VaultError::ConnectionError(
                "server closed the upload early".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn finish(&mut self) -> Result<(), VaultError> {
        let Some(task) = self.task.take() else {
            return Err(VaultError::ConnectionError("upload already finished".to_string()));
        };
        let result = match task.await {
            Err(e) => Err(VaultError::ConnectionError(format!("upload task: {}", e))),
            Ok(Err(e)) => Err(transport(e)),
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(map_http_status(resp.status(), "PUT")),
        };
        result.map_err(|e| self.slot.check(e))
    }
}

#[async_trait]
impl ByteSink for WebDavSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), VaultError> {
        match self.pending.replace(chunk) {
            Some(previous) => self.send(previous).await,
            None => Ok(()),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), VaultError> {
        let mut this = self;
        if let Some(last) = this.pending.take() {
            this.send(last).await?;
        }
        // Closing the channel ends the request body
        this.tx = None;
        this.finish().await
    }

    async fn abort(self: Box<Self>) {
        let mut this = self;
        this.pending = None;
        if let Some(tx) = this.tx.take() {
            let _ = tx.try_send(Err(std::io::Error::other("upload aborted")));
        }
        if let Some(task) = this.task.take() {
            task.abort();
        }
    }
}

impl Drop for WebDavSink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_model::PathFlavor;
    use crate::providers::ErrorKind;
    use secrecy::SecretString;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ROOT: &str = "/remote.php/dav/files/alice/";

    fn response(href: &str, collection: bool, size: Option<u64>) -> String {
        let rt = if collection { "<d:collection/>" } else { "" };
        let len = size
            .map(|s| format!("<d:getcontentlength>{}</d:getcontentlength>", s))
            .unwrap_or_default();
        format!(
            "<d:response><d:href>{}</d:href><d:propstat><d:prop>\
             <d:resourcetype>{}</d:resourcetype>{}\
             <d:getlastmodified>Mon, 01 Jan 2024 10:00:00 GMT</d:getlastmodified>\
             </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
            href, rt, len
        )
    }

    fn multistatus(responses: &[String]) -> String {
        format!(
            r#"<?xml version="1.0"?><d:multistatus xmlns:d="DAV:">{}</d:multistatus>"#,
            responses.concat()
        )
    }

    fn adapter(server: &MockServer) -> WebDavAdapter {
        let target = CloudTarget::new(
            &server.uri(),
            Credentials::Password {
                username: "alice".to_string(),
                password: SecretString::from("pw".to_string()),
            },
        );
        WebDavAdapter::new(target, ConnectionSettings::default()).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let kind = |code: u16| map_http_status(StatusCode::from_u16(code).unwrap(), "x").kind();
        assert_eq!(kind(404), ErrorKind::NotFound);
        assert_eq!(kind(409), ErrorKind::NotFound);
        assert_eq!(kind(401), ErrorKind::PermissionDenied);
        assert_eq!(kind(403), ErrorKind::PermissionDenied);
        assert_eq!(kind(507), ErrorKind::QuotaExceeded);
        assert_eq!(kind(502), ErrorKind::ConnectionError);
    }

    #[test]
    fn test_parser_handles_prefixes_and_entities() {
        let parser = MultistatusParser::new().unwrap();
        let xml = r#"<D:multistatus xmlns:D="DAV:"><D:response>
            <D:href>/dav/Tom%20&amp;%20Jerry/</D:href>
            <D:propstat><D:prop><D:resourcetype><D:collection xmlns:D="DAV:"/></D:resourcetype></D:prop></D:propstat>
            </D:response><response><href>/dav/x.bin</href><getcontentlength>7</getcontentlength><resourcetype/></response>
            </D:multistatus>"#;
        let res = parser.parse(xml);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].href, "/dav/Tom%20&%20Jerry/");
        assert!(res[0].is_collection);
        assert!(!res[1].is_collection);
        assert_eq!(res[1].size, Some(7));
    }

    #[tokio::test]
    async fn test_listing_scenario() {
        let server = MockServer::start().await;
        let body = multistatus(&[
            response(&format!("{}Photos/", ROOT), true, None),
            response(&format!("{}Photos/b.jpg", ROOT), false, Some(3)),
            response(&format!("{}Photos/A/", ROOT), true, None),
            response(&format!("{}Photos/a.jpg", ROOT), false, Some(5)),
            response(&format!("{}Photos/My%20Clip.mp4", ROOT), false, Some(9)),
        ]);
        Mock::given(method("PROPFIND"))
            .and(path(format!("{}Photos/", ROOT)))
            .and(header("Depth", "1"))
            .respond_with(ResponseTemplate::new(207).set_body_string(body))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let dir = RemotePath::parse(PathFlavor::Cloud, "/Photos").unwrap();
        let listing = adapter.list_directory(&dir).await.unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["A", "a.jpg", "b.jpg", "My Clip.mp4"]);
        assert_eq!(listing[1].size(), Some(5));
        assert_eq!(
            listing[1].modified_at().unwrap().to_rfc3339(),
            "2024-01-01T10:00:00+00:00"
        );
        assert_eq!(listing[3].remote_ref().path.to_wire(), "/Photos/My Clip.mp4");
    }

    #[tokio::test]
    async fn test_listing_errors_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path(format!("{}Private/", ROOT)))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("PROPFIND"))
            .and(path(format!("{}Gone/", ROOT)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let private = RemotePath::parse(PathFlavor::Cloud, "/Private").unwrap();
        let gone = RemotePath::parse(PathFlavor::Cloud, "/Gone").unwrap();
        assert_eq!(
            adapter.list_directory(&private).await.unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            adapter.list_directory(&gone).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_stat_and_read() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path(format!("{}clip.mp4", ROOT)))
            .and(header("Depth", "0"))
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(&[response(
                &format!("{}clip.mp4", ROOT),
                false,
                Some(11),
            )])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}clip.mp4", ROOT)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let r = RemoteRef::new(
            adapter.backend_id().clone(),
            RemotePath::parse(PathFlavor::Cloud, "/clip.mp4").unwrap(),
        );
        let entry = adapter.stat_entry(&r).await.unwrap();
        assert_eq!(entry.size(), Some(11));
        assert_eq!(entry.kind(), EntryKind::File);

        let chunks: Vec<Bytes> = adapter.open_for_read(&r).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world");
    }

    #[tokio::test]
    async fn test_upload_creates_parents_and_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("MKCOL"))
            .and(path(format!("{}Trips/", ROOT)))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("MKCOL"))
            .and(path(format!("{}Trips/2024/", ROOT)))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{}Trips/2024/beach.jpg", ROOT)))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let dest = RemotePath::parse(PathFlavor::Cloud, "/Trips/2024/beach.jpg").unwrap();
        let mut sink = adapter.open_for_write(&dest, Some(10)).await.unwrap();
        sink.write(Bytes::from_static(b"01234")).await.unwrap();
        sink.write(Bytes::from_static(b"56789")).await.unwrap();
        sink.commit().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let put = requests
            .iter()
            .find(|r| r.method.as_str() == "PUT")
            .unwrap();
        assert_eq!(put.body, b"0123456789");
    }

    #[tokio::test]
    async fn test_aborted_upload_never_completes_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let dest = RemotePath::parse(PathFlavor::Cloud, "/draft.bin").unwrap();
        let mut sink = adapter.open_for_write(&dest, Some(10)).await.unwrap();
        sink.write(Bytes::from_static(b"01234")).await.unwrap();
        sink.write(Bytes::from_static(b"56789")).await.unwrap();
        sink.abort().await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let requests = server.received_requests().await.unwrap();
        assert!(!requests
            .iter()
            .any(|r| r.method.as_str() == "PUT" && r.body == b"0123456789"));

        // the session survives an abort
        let next = RemotePath::parse(PathFlavor::Cloud, "/final.bin").unwrap();
        let mut sink = adapter.open_for_write(&next, Some(3)).await.unwrap();
        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.commit().await.unwrap();
        let requests = server.received_requests().await.unwrap();
        let committed: Vec<&[u8]> = requests
            .iter()
            .filter(|r| r.method.as_str() == "PUT")
            .map(|r| r.body.as_slice())
            .collect();
        assert_eq!(committed, vec![&b"abc"[..]]);
    }

    #[tokio::test]
    async fn test_upload_quota_failure_reported_on_commit() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(507))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let dest = RemotePath::parse(PathFlavor::Cloud, "/big.mov").unwrap();
        let mut sink = adapter.open_for_write(&dest, None).await.unwrap();
        let wrote = sink.write(Bytes::from_static(b"data")).await;
        let result = match wrote {
            Ok(()) => sink.commit().await,
            Err(e) => Err(e),
        };
        assert_eq!(result.unwrap_err().kind(), ErrorKind::QuotaExceeded);
    }

    fn ocs(statuscode: u32, data: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "ocs": {
                "meta": { "status": "ok", "statuscode": statuscode, "message": "OK" },
                "data": data
            }
        })
    }

    #[tokio::test]
    async fn test_quota_from_ocs_user() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ocs/v1.php/cloud/users/alice"))
            .and(query_param("format", "json"))
            .and(header("OCS-APIRequest", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ocs(
                100,
                serde_json::json!({
                    "id": "alice",
                    "quota": { "free": 1500, "used": 500, "total": 2000, "relative": 25.0, "quota": 2000 }
                }),
            )))
            .mount(&server)
            .await;

        let quota = adapter(&server).quota().await.unwrap().unwrap();
        assert_eq!(
            quota,
            StorageQuota {
                used: 500,
                free: Some(1500),
                total: Some(2000),
            }
        );
        assert!(quota.fits(1500));
        assert!(!quota.fits(1501));
    }

    #[tokio::test]
    async fn test_quota_unlimited_and_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ocs/v1.php/cloud/users/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ocs(
                100,
                serde_json::json!({ "quota": { "free": -3, "used": 42, "quota": -3 } }),
            )))
            .mount(&server)
            .await;
        let quota = adapter(&server).quota().await.unwrap().unwrap();
        assert_eq!(quota.used, 42);
        assert_eq!(quota.free, None);
        assert!(quota.fits(u64::MAX));

        let refused = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ocs(997, serde_json::json!([]))))
            .mount(&refused)
            .await;
        assert_eq!(
            adapter(&refused).quota().await.unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_anonymous_account_has_no_quota() {
        let target = CloudTarget::new(
            "https://cloud.example.com/remote.php/dav/files/guest/",
            Credentials::Anonymous,
        );
        let adapter = WebDavAdapter::new(target, ConnectionSettings::default()).unwrap();
        assert_eq!(adapter.quota().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capabilities() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ocs/v1.php/cloud/capabilities"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ocs(
                100,
                serde_json::json!({
                    "version": { "major": 27, "minor": 1, "micro": 3, "string": "27.1.3", "edition": "" },
                    "capabilities": { "files": { "bigfilechunking": true }, "dav": { "chunking": "1.0" } }
                }),
            )))
            .mount(&server)
            .await;

        let caps = adapter(&server).capabilities().await.unwrap();
        let version = caps.version.as_ref().unwrap();
        assert_eq!(version.major, 27);
        assert_eq!(version.string, "27.1.3");
        assert!(caps.has("dav"));
        assert!(!caps.has("spreed"));
    }
}
