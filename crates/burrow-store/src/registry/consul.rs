//! Consul coordination backend.
//!
//! Placement entries live in the Consul KV store under a prefix; nodes are
//! discovered through the catalog, where each serving node registers a
//! service tagged with its node id and carrying its attach endpoint in the
//! service metadata. A TCP health check on the control address lets Consul
//! drop nodes that disappear without withdrawing.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use burrow_common::error::{BurrowError, Result};
use serde::Deserialize;

use super::{Announce, Discovery, Node, Registry};

/// Deadline for a single request to the agent.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal blocking client for the Consul HTTP API.
#[derive(Debug, Clone)]
struct ConsulHttp {
    client: reqwest::blocking::Client,
    base: String,
}

impl ConsulHttp {
    fn new(address: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BurrowError::Config {
                message: format!("cannot build HTTP client: {e}"),
            })?;
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Ok(Self { client, base })
    }

    fn transport(&self, message: impl std::fmt::Display) -> BurrowError {
        BurrowError::Transport {
            addr: self.base.clone(),
            message: message.to_string(),
        }
    }

    fn check(&self, response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.transport(format!("consul returned {}", response.status())))
        }
    }

    /// GETs `path`; `None` on 404.
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .map_err(|e| self.transport(e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self
            .check(response)?
            .bytes()
            .map_err(|e| self.transport(e))?;
        Ok(Some(body.to_vec()))
    }

    fn put(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .put(format!("{}{path}", self.base))
            .body(body)
            .send()
            .map_err(|e| self.transport(e))?;
        let _ = self.check(response)?;
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}{path}", self.base))
            .send()
            .map_err(|e| self.transport(e))?;
        let _ = self.check(response)?;
        Ok(())
    }
}

/// [`Registry`] over the Consul KV store.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    http: ConsulHttp,
    prefix: String,
}

impl ConsulRegistry {
    /// Creates a registry storing entries under `prefix` on the agent at
    /// `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if the HTTP client cannot be built.
    pub fn new(address: &str, prefix: &str) -> Result<Self> {
        Ok(Self {
            http: ConsulHttp::new(address)?,
            prefix: format!("{}/", prefix.trim_matches('/')),
        })
    }

    fn kv_path(&self, key: &str) -> String {
        format!("/v1/kv/{}{key}", self.prefix)
    }
}

impl Discovery for ConsulRegistry {
    fn list(&self) -> Result<Vec<Node>> {
        let path = format!("{}?recurse", self.kv_path(""));
        match self.http.get(&path)? {
            Some(body) => Ok(parse_kv_listing(&body)?
                .into_iter()
                .map(|(_, node)| node)
                .collect()),
            None => Ok(Vec::new()),
        }
    }
}

impl Registry for ConsulRegistry {
    fn get(&self, key: &str) -> Result<Option<Node>> {
        let path = format!("{}?raw", self.kv_path(key));
        match self.http.get(&path)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, node: &Node) -> Result<()> {
        self.http.put(&self.kv_path(key), serde_json::to_vec(node)?)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.http.delete(&self.kv_path(key))
    }
}

/// [`Discovery`] and [`Announce`] through the Consul service catalog.
#[derive(Debug, Clone)]
pub struct ConsulDiscovery {
    http: ConsulHttp,
    service: String,
}

impl ConsulDiscovery {
    /// Creates discovery for `service` on the agent at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if the HTTP client cannot be built.
    pub fn new(address: &str, service: &str) -> Result<Self> {
        Ok(Self {
            http: ConsulHttp::new(address)?,
            service: service.to_string(),
        })
    }
}

impl Discovery for ConsulDiscovery {
    fn list(&self) -> Result<Vec<Node>> {
        match self
            .http
            .get(&format!("/v1/catalog/service/{}", self.service))?
        {
            Some(body) => parse_catalog(&body),
            None => Ok(Vec::new()),
        }
    }
}

impl Announce for ConsulDiscovery {
    fn announce(&self, node: &Node) -> Result<()> {
        let body = registration(&self.service, node)?;
        self.http
            .put("/v1/agent/service/register", serde_json::to_vec(&body)?)?;
        tracing::info!(service = %self.service, addr = %node.addr, "registered with consul");
        Ok(())
    }

    fn withdraw(&self, node: &Node) -> Result<()> {
        let id = service_id(&self.service, node);
        self.http
            .put(&format!("/v1/agent/service/deregister/{id}"), Vec::new())?;
        tracing::info!(service = %self.service, id = %id, "deregistered from consul");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    value: Option<String>,
}

/// Decodes a `?recurse` KV listing into `(key, node)` pairs, skipping
/// entries without a value.
fn parse_kv_listing(body: &[u8]) -> Result<Vec<(String, Node)>> {
    let entries: Vec<KvEntry> = serde_json::from_slice(body)?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(encoded) = entry.value else {
            continue;
        };
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| BurrowError::Internal {
                message: format!("bad base64 in consul key {}: {e}", entry.key),
            })?;
        match serde_json::from_slice::<Node>(&raw) {
            Ok(node) => out.push((entry.key, node)),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "skipping malformed consul entry"),
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry {
    #[serde(default)]
    address: String,
    #[serde(default)]
    service_address: String,
    service_port: u16,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    #[serde(default)]
    service_meta: Option<BTreeMap<String, String>>,
}

/// Decodes a catalog service listing; the first tag is the node id.
fn parse_catalog(body: &[u8]) -> Result<Vec<Node>> {
    let entries: Vec<CatalogEntry> = serde_json::from_slice(body)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let host = if entry.service_address.is_empty() {
                entry.address
            } else {
                entry.service_address
            };
            Node {
                id: entry.service_tags.and_then(|tags| tags.into_iter().next()),
                addr: format!("{host}:{}", entry.service_port),
                meta: entry.service_meta.unwrap_or_default(),
            }
        })
        .collect())
}

fn service_id(service: &str, node: &Node) -> String {
    format!("{service}-{}", node.id.as_deref().unwrap_or(&node.addr))
}

/// Builds the agent registration body for a node.
fn registration(service: &str, node: &Node) -> Result<serde_json::Value> {
    let (host, port) = node
        .addr
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
        .ok_or_else(|| BurrowError::InvalidArgument {
            message: format!("node address must be host:port, got {}", node.addr),
        })?;
    Ok(serde_json::json!({
        "ID": service_id(service, node),
        "Name": service,
        "Tags": node.id.iter().collect::<Vec<_>>(),
        "Address": host,
        "Port": port,
        "Meta": node.meta,
        "Check": {
            "TCP": node.addr,
            "Interval": "10s",
            "DeregisterCriticalServiceAfter": "1m",
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_listing_decodes_nodes_and_skips_folders() {
        let value = STANDARD.encode(br#"{"addr":"10.0.0.2:7420"}"#);
        let body = format!(
            r#"[{{"Key":"burrow/cntrs/","Value":null}},{{"Key":"burrow/cntrs/n1,3","Value":"{value}"}}]"#
        );
        let entries = parse_kv_listing(body.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "burrow/cntrs/n1,3");
        assert_eq!(entries[0].1, Node::at("10.0.0.2:7420"));
    }

    #[test]
    fn catalog_uses_service_address_and_first_tag() {
        let body = br#"[
            {"Address":"10.0.0.9","ServiceAddress":"10.0.1.9","ServicePort":7420,
             "ServiceTags":["n9"],"ServiceMeta":{"attachNetwork":"tcp","attach":"10.0.1.9:7421"}},
            {"Address":"10.0.0.8","ServiceAddress":"","ServicePort":7420,"ServiceTags":null}
        ]"#;
        let nodes = parse_catalog(body).unwrap();
        assert_eq!(nodes[0].addr, "10.0.1.9:7420");
        assert_eq!(nodes[0].id.as_deref(), Some("n9"));
        assert_eq!(nodes[0].attach_addr(), Some("10.0.1.9:7421"));
        assert_eq!(nodes[1].addr, "10.0.0.8:7420");
        assert!(nodes[1].id.is_none());
    }

    #[test]
    fn registration_carries_meta_tag_and_check() {
        let node = Node::at("10.0.0.1:7420").with_id("n1").with_attach("10.0.0.1:7421");
        let body = registration("burrow", &node).unwrap();
        assert_eq!(body["ID"], "burrow-n1");
        assert_eq!(body["Port"], 7420);
        assert_eq!(body["Tags"][0], "n1");
        assert_eq!(body["Meta"]["attach"], "10.0.0.1:7421");
        assert_eq!(body["Check"]["TCP"], "10.0.0.1:7420");
    }

    #[test]
    fn registration_rejects_address_without_port() {
        assert!(registration("burrow", &Node::at("localhost")).is_err());
    }

    #[test]
    fn base_url_gets_scheme() {
        let http = ConsulHttp::new("127.0.0.1:8500/").unwrap();
        assert_eq!(http.base, "http://127.0.0.1:8500");
    }
}
