//! Azure Blob Storage backend.
//!
//! Talks to the Blob service REST API over reqwest with manual Shared Key
//! request signing, so no SDK dependency is needed. Works against the public
//! cloud and the Azurite emulator (path-style account URLs).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use sha2::Sha256;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use snapstore_common::backend::{BlobPager, BlockBlobClient, ContainerClient, SnapReader};
use snapstore_common::{Result, SnapstoreError};

use crate::credentials::AbsCredentials;
use crate::snapstore::PROVIDER_CONNECTION_TIMEOUT;

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";

/// Authenticated transport shared by a container and its blob clients.
struct AbsTransport {
    client: Client,
    /// Service URL, e.g. `https://acct.blob.core.windows.net`.
    endpoint: String,
    account: String,
    key: Vec<u8>,
}

impl AbsTransport {
    fn new(endpoint: &str, credentials: &AbsCredentials) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(credentials.storage_key.trim())
            .map_err(|e| {
                SnapstoreError::Configuration(format!("storage key is not valid base64: {}", e))
            })?;
        let client = Client::builder()
            .connect_timeout(PROVIDER_CONNECTION_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            account: credentials.storage_account.clone(),
            key,
        })
    }

    /// Send a signed request. `path` is the already-encoded resource path
    /// below the service URL, starting with `/`.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Bytes>,
        content_type: Option<&str>,
    ) -> Result<Response> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_length = body.as_ref().map(|b| b.len()).unwrap_or(0);
        let content_md5 = body
            .as_ref()
            .filter(|b| !b.is_empty())
            .map(|b| base64::engine::general_purpose::STANDARD.encode(md5::compute(b).0));

        let mut ms_headers = BTreeMap::new();
        ms_headers.insert("x-ms-date".to_string(), date);
        ms_headers.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let resource = canonicalized_resource(
            &self.account,
            &format!("{}{}", url_path(&self.endpoint), path),
            query,
        );
        let to_sign = string_to_sign(
            method.as_str(),
            content_length,
            content_md5.as_deref().unwrap_or(""),
            content_type.unwrap_or(""),
            &ms_headers,
            &resource,
        );
        let auth = format!("SharedKey {}:{}", self.account, sign(&self.key, &to_sign));

        let mut url = format!("{}{}", self.endpoint, path);
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect();
            url = format!("{}?{}", url, encoded.join("&"));
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", auth);
        for (name, value) in &ms_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(md5) = &content_md5 {
            req = req.header("Content-MD5", md5.as_str());
        }
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        Ok(req.send().await?)
    }
}

/// Turn a non-success response into a `Service` error.
async fn service_error(operation: &str, resp: Response) -> SnapstoreError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    SnapstoreError::Service {
        operation: operation.to_string(),
        status,
        body,
    }
}

pub struct AbsContainer {
    transport: Arc<AbsTransport>,
    name: String,
    clients: Mutex<HashMap<String, Arc<AbsBlob>>>,
}

impl AbsContainer {
    pub fn new(endpoint: &str, credentials: &AbsCredentials, container: &str) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(AbsTransport::new(endpoint, credentials)?),
            name: container.to_string(),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail with `ContainerNotFound` unless the container exists.
    pub async fn ensure_exists(&self) -> Result<()> {
        let resp = self
            .transport
            .send(
                Method::HEAD,
                &format!("/{}", urlencoding::encode(&self.name)),
                &[("restype", "container")],
                None,
                None,
            )
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SnapstoreError::ContainerNotFound(self.name.clone())),
            _ => Err(service_error("get container properties", resp).await),
        }
    }
}

impl ContainerClient for AbsContainer {
    fn list_blobs_flat(&self, prefix: &str) -> Box<dyn BlobPager> {
        Box::new(AbsPager {
            transport: self.transport.clone(),
            container: self.name.clone(),
            prefix: prefix.to_string(),
            marker: None,
            started: false,
        })
    }

    fn block_blob_client(&self, blob_name: &str) -> Arc<dyn BlockBlobClient> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let client = clients
            .entry(blob_name.to_string())
            .or_insert_with(|| {
                Arc::new(AbsBlob {
                    transport: self.transport.clone(),
                    container: self.name.clone(),
                    name: blob_name.to_string(),
                })
            })
            .clone();
        client
    }
}

/// List Blobs pager following `NextMarker` continuation tokens.
struct AbsPager {
    transport: Arc<AbsTransport>,
    container: String,
    prefix: String,
    marker: Option<String>,
    started: bool,
}

#[async_trait]
impl BlobPager for AbsPager {
    fn more(&self) -> bool {
        !self.started || self.marker.is_some()
    }

    async fn next_page(&mut self) -> Result<Vec<String>> {
        let mut query = vec![("restype", "container"), ("comp", "list")];
        if !self.prefix.is_empty() {
            query.push(("prefix", self.prefix.as_str()));
        }
        if let Some(marker) = &self.marker {
            query.push(("marker", marker.as_str()));
        }

        let resp = self
            .transport
            .send(
                Method::GET,
                &format!("/{}", urlencoding::encode(&self.container)),
                &query,
                None,
                None,
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SnapstoreError::ContainerNotFound(self.container.clone()));
        }
        if !resp.status().is_success() {
            return Err(service_error("list blobs", resp).await);
        }

        let body = resp.text().await?;
        let names = parse_blob_names(&body);
        self.marker = parse_next_marker(&body);
        self.started = true;
        debug!(
            container = %self.container,
            prefix = %self.prefix,
            count = names.len(),
            more = self.marker.is_some(),
            "Fetched blob listing page"
        );
        Ok(names)
    }
}

pub struct AbsBlob {
    transport: Arc<AbsTransport>,
    container: String,
    name: String,
}

impl AbsBlob {
    fn path(&self) -> String {
        format!(
            "/{}/{}",
            urlencoding::encode(&self.container),
            encode_blob_name(&self.name)
        )
    }
}

#[async_trait]
impl BlockBlobClient for AbsBlob {
    async fn download_stream(&self) -> Result<SnapReader> {
        let resp = self
            .transport
            .send(Method::GET, &self.path(), &[], None, None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SnapstoreError::ObjectNotFound(self.name.clone()));
        }
        if !resp.status().is_success() {
            return Err(service_error("download blob", resp).await);
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn delete(&self) -> Result<()> {
        let resp = self
            .transport
            .send(Method::DELETE, &self.path(), &[], None, None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SnapstoreError::ObjectNotFound(self.name.clone()));
        }
        if !resp.status().is_success() {
            return Err(service_error("delete blob", resp).await);
        }
        debug!(blob = %self.name, "Blob delete complete");
        Ok(())
    }

    async fn commit_block_list(&self, block_ids: &[String]) -> Result<()> {
        let resp = self
            .transport
            .send(
                Method::PUT,
                &self.path(),
                &[("comp", "blocklist")],
                Some(Bytes::from(block_list_xml(block_ids))),
                Some("application/xml"),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(service_error("put block list", resp).await);
        }
        debug!(blob = %self.name, blocks = block_ids.len(), "Block list committed");
        Ok(())
    }

    async fn stage_block(&self, block_id: &str, data: Bytes) -> Result<()> {
        let len = data.len();
        let resp = self
            .transport
            .send(
                Method::PUT,
                &self.path(),
                &[("comp", "block"), ("blockid", block_id)],
                Some(data),
                None,
            )
            .await?;
        if !resp.status().is_success() {
            let err = service_error("put block", resp).await;
            warn!(blob = %self.name, block_id, error = %err, "Put block failed");
            return Err(err);
        }
        debug!(blob = %self.name, block_id, len, "Block staged");
        Ok(())
    }
}

/// Shared Key string-to-sign for the Blob service.
fn string_to_sign(
    method: &str,
    content_length: usize,
    content_md5: &str,
    content_type: &str,
    ms_headers: &BTreeMap<String, String>,
    canonicalized_resource: &str,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    let headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    // Content-Encoding, Content-Language, Date and the conditional headers
    // are never sent, so their lines stay empty.
    format!(
        "{}\n\n\n{}\n{}\n{}\n\n\n\n\n\n\n{}{}",
        method, length, content_md5, content_type, headers, canonicalized_resource
    )
}

/// `/{account}{path}` followed by one `\nname:value` line per query
/// parameter, sorted by name.
fn canonicalized_resource(account: &str, path: &str, query: &[(&str, &str)]) -> String {
    let mut params: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for &(k, v) in query {
        params.entry(k.to_lowercase()).or_default().push(v);
    }
    let mut resource = format!("/{}{}", account, path);
    for (k, mut values) in params {
        values.sort_unstable();
        resource.push_str(&format!("\n{}:{}", k, values.join(",")));
    }
    resource
}

fn sign(key: &[u8], string_to_sign: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Path part of a URL, without a trailing slash.
fn url_path(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match without_scheme.find('/') {
        Some(i) => without_scheme[i..].trim_end_matches('/'),
        None => "",
    }
}

/// Percent-encode each path segment of a blob name, keeping `/`.
fn encode_blob_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Extract `<Name>…</Name>` values from a List Blobs response.
fn parse_blob_names(xml: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Name>") {
        remaining = &remaining[start + 6..];
        if let Some(end) = remaining.find("</Name>") {
            names.push(unescape_xml(&remaining[..end]));
            remaining = &remaining[end + 7..];
        }
    }
    names
}

/// Continuation token of a List Blobs response, `None` on the last page.
fn parse_next_marker(xml: &str) -> Option<String> {
    let start = xml.find("<NextMarker>")? + "<NextMarker>".len();
    let end = xml[start..].find("</NextMarker>")?;
    let marker = xml[start..start + end].trim();
    if marker.is_empty() {
        None
    } else {
        Some(unescape_xml(marker))
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
