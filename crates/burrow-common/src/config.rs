//! Node configuration model.
//!
//! A node reads an optional JSON file; every field has a default so an
//! empty object is a valid configuration. Command-line flags are applied
//! on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BurrowError, Result};

/// Which runtime backend materializes containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Linux namespaces, cgroups, and chroot.
    #[default]
    Namespace,
    /// Plain host processes rooted at the rootfs directory, no isolation.
    Host,
}

impl std::str::FromStr for RuntimeKind {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "namespace" => Ok(Self::Namespace),
            "host" => Ok(Self::Host),
            other => Err(BurrowError::Config {
                message: format!("unknown runtime kind: {other}"),
            }),
        }
    }
}

/// Connection settings for a Consul agent used as the coordination backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Agent HTTP address, e.g. `http://127.0.0.1:8500`.
    pub address: String,
    /// Service name nodes register under.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// KV prefix for placement entries.
    #[serde(default = "default_kv_prefix")]
    pub kv_prefix: String,
}

impl ConsulConfig {
    /// Settings for the agent at `address` with default names.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            service_name: default_service_name(),
            kv_prefix: default_kv_prefix(),
        }
    }
}

fn default_service_name() -> String {
    constants::DEFAULT_SERVICE_NAME.into()
}

fn default_kv_prefix() -> String {
    format!("{}/cntrs/", constants::APP_NAME)
}

/// Root configuration of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Base directory for the store and relative rootfs paths.
    pub data_dir: PathBuf,
    /// Control channel listen address.
    pub listen_addr: String,
    /// Attach listener address.
    pub attach_addr: String,
    /// Runtime backend.
    pub runtime: RuntimeKind,
    /// Run without root: no network namespace and a read-only `/sys` bind.
    pub rootless: bool,
    /// Maximum results per remote list call.
    pub query_limit: usize,
    /// Maximum concurrent attach sessions.
    pub attach_session_limit: usize,
    /// Attach token lifetime in seconds.
    pub attach_token_ttl_secs: u64,
    /// Default remote call deadline in seconds.
    pub call_timeout_secs: u64,
    /// Optional Consul coordination backend.
    pub consul: Option<ConsulConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::default_data_dir(),
            listen_addr: constants::DEFAULT_LISTEN_ADDR.into(),
            attach_addr: constants::DEFAULT_ATTACH_ADDR.into(),
            runtime: RuntimeKind::default(),
            rootless: false,
            query_limit: constants::DEFAULT_QUERY_LIMIT,
            attach_session_limit: constants::DEFAULT_ATTACH_SESSION_LIMIT,
            attach_token_ttl_secs: constants::DEFAULT_ATTACH_TOKEN_TTL_SECS,
            call_timeout_secs: constants::DEFAULT_CALL_TIMEOUT_SECS,
            consul: None,
        }
    }
}

impl NodeConfig {
    /// Loads a configuration file, filling unset fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| BurrowError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] for zero limits or an empty address.
    pub fn validate(&self) -> Result<()> {
        if self.query_limit == 0 {
            return Err(BurrowError::Config {
                message: "query_limit must be positive".into(),
            });
        }
        if self.attach_session_limit == 0 {
            return Err(BurrowError::Config {
                message: "attach_session_limit must be positive".into(),
            });
        }
        if self.listen_addr.is_empty() || self.attach_addr.is_empty() {
            return Err(BurrowError::Config {
                message: "listen and attach addresses are required".into(),
            });
        }
        Ok(())
    }

    /// Path of the embedded store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(constants::STORE_FILE)
    }

    /// Attach token lifetime.
    pub const fn attach_token_ttl(&self) -> Duration {
        Duration::from_secs(self.attach_token_ttl_secs)
    }

    /// Default remote call deadline.
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{}").expect("write config");
        let config = NodeConfig::load(&path).expect("load");
        assert_eq!(config.query_limit, constants::DEFAULT_QUERY_LIMIT);
        assert_eq!(config.listen_addr, constants::DEFAULT_LISTEN_ADDR);
        assert!(config.consul.is_none());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"runtime":"host","query_limit":8,"consul":{"address":"http://consul:8500"}}"#,
        )
        .expect("write config");
        let config = NodeConfig::load(&path).expect("load");
        assert_eq!(config.runtime, RuntimeKind::Host);
        assert_eq!(config.query_limit, 8);
        let consul = config.consul.expect("consul section");
        assert_eq!(consul.service_name, "burrow");
        assert_eq!(consul.kv_prefix, "burrow/cntrs/");
    }

    #[test]
    fn zero_limit_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"query_limit":0}"#).expect("write config");
        assert!(matches!(
            NodeConfig::load(&path),
            Err(BurrowError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = NodeConfig::load(Path::new("/nonexistent/burrow.json")).unwrap_err();
        assert!(matches!(err, BurrowError::Io { .. }));
    }

    #[test]
    fn runtime_kind_parses() {
        assert_eq!("host".parse::<RuntimeKind>().unwrap(), RuntimeKind::Host);
        assert!("vm".parse::<RuntimeKind>().is_err());
    }
}
