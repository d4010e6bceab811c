use crate::error::{FdbError, FdbResult};
use crate::schema::Schema;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Inline YAML configuration.
pub const ENV_CONFIG: &str = "FDB5_CONFIG";
/// Path to a YAML configuration file.
pub const ENV_CONFIG_FILE: &str = "FDB5_CONFIG_FILE";
/// Installation root used for `~fdb/` expansion.
pub const ENV_HOME: &str = "FDB_HOME";
/// Explicit schema path, overriding the configured one.
pub const ENV_SCHEMA_FILE: &str = "FDB_SCHEMA_FILE";
/// Pin for the TOC serialisation version.
pub const ENV_SERIALISATION_VERSION: &str = "FDB_SERIALISATION_VERSION";
/// Pin for the remote protocol version.
pub const ENV_REMOTE_PROTOCOL_VERSION: &str = "FDB_REMOTE_PROTOCOL_VERSION";
/// Client-side archive queue bound.
pub const ENV_ARCHIVE_QUEUE_LENGTH: &str = "FDB_REMOTE_ARCHIVE_QUEUE_LENGTH";
/// Client-side retrieve queue bound.
pub const ENV_RETRIEVE_QUEUE_LENGTH: &str = "FDB_REMOTE_RETRIEVE_QUEUE_LENGTH";

const DEFAULT_SERVER_PORT: u16 = 7654;
const DEFAULT_ARCHIVE_QUEUE_LENGTH: usize = 320;
const DEFAULT_RETRIEVE_QUEUE_LENGTH: usize = 64;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreEndpoint {
    #[serde(default)]
    pub default: bool,
    pub name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RootConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,
    pub netmask: String,
}

/// Process configuration, deserialised from YAML. Every field has a default
/// so an empty document is a valid local configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// `local`, `remote` or `random`.
    pub r#type: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub stores: Vec<StoreEndpoint>,
    pub field_location_endpoints: Vec<String>,
    pub roots: Vec<RootConfig>,
    pub networks: Vec<NetworkConfig>,
    pub schema: Option<PathBuf>,
    /// Octal permissions applied to created DB directories.
    pub permissions: Option<String>,
    pub server_port: u16,
    pub server_threaded: bool,
    pub data_port_start: u16,
    pub data_port_count: u16,
    pub single_connection: bool,
    pub archive_queue_length: usize,
    pub retrieve_queue_length: usize,
    /// Redirect this process's TOC appends into a private sub-TOC.
    pub use_sub_toc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            r#type: "local".to_string(),
            host: None,
            port: None,
            stores: Vec::new(),
            field_location_endpoints: Vec::new(),
            roots: Vec::new(),
            networks: Vec::new(),
            schema: None,
            permissions: None,
            server_port: DEFAULT_SERVER_PORT,
            server_threaded: false,
            data_port_start: 0,
            data_port_count: 0,
            single_connection: false,
            archive_queue_length: DEFAULT_ARCHIVE_QUEUE_LENGTH,
            retrieve_queue_length: DEFAULT_RETRIEVE_QUEUE_LENGTH,
            use_sub_toc: false,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> FdbResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| FdbError::usage(format!("invalid configuration: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> FdbResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Resolution order: inline `FDB5_CONFIG`, then `FDB5_CONFIG_FILE`,
    /// then defaults.
    pub fn from_env() -> FdbResult<Self> {
        if let Ok(inline) = std::env::var(ENV_CONFIG) {
            debug!("loading configuration from {ENV_CONFIG}");
            return Self::from_yaml(&inline);
        }
        if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
            debug!(path, "loading configuration from {ENV_CONFIG_FILE}");
            return Self::from_file(expand_home(&PathBuf::from(path)));
        }
        Ok(Self::default())
    }

    /// The first configured root, where new databases are created.
    pub fn writable_root(&self) -> FdbResult<PathBuf> {
        self.roots
            .first()
            .map(|r| expand_home(&r.path))
            .ok_or_else(|| FdbError::usage("no roots configured"))
    }

    pub fn root_paths(&self) -> Vec<PathBuf> {
        self.roots.iter().map(|r| expand_home(&r.path)).collect()
    }

    /// Schema path, honouring the `FDB_SCHEMA_FILE` override.
    pub fn schema_path(&self) -> FdbResult<PathBuf> {
        if let Ok(path) = std::env::var(ENV_SCHEMA_FILE) {
            return Ok(expand_home(&PathBuf::from(path)));
        }
        self.schema
            .as_ref()
            .map(|p| expand_home(p))
            .ok_or_else(|| FdbError::usage("no schema configured"))
    }

    pub fn load_schema(&self) -> FdbResult<Schema> {
        let path = self.schema_path()?;
        Schema::from_file(&path)
            .map_err(|e| FdbError::usage(format!("schema {}: {e}", path.display())))
    }

    pub fn archive_queue_length(&self) -> usize {
        env_usize(ENV_ARCHIVE_QUEUE_LENGTH).unwrap_or(self.archive_queue_length)
    }

    pub fn retrieve_queue_length(&self) -> usize {
        env_usize(ENV_RETRIEVE_QUEUE_LENGTH).unwrap_or(self.retrieve_queue_length)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Expands a leading `~fdb/` against `FDB_HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~fdb/")) else {
        return path.to_path_buf();
    };
    match std::env::var(ENV_HOME) {
        Ok(home) => PathBuf::from(home).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_a_local_config() {
        let config = Config::from_yaml("{}").expect("parse");
        assert_eq!(config.r#type, "local");
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
        assert!(config.writable_root().is_err());
    }

    #[test]
    fn full_document_parses() {
        let config = Config::from_yaml(
            r#"
type: remote
host: fdb.example
port: 7654
roots:
  - path: /data/fdb
  - path: /data/fdb-backup
    bucket: backup
stores:
  - name: cluster
    endpoint: store.example:7655
    default: true
schema: /etc/fdb/schema.yaml
serverPort: 9000
dataPortStart: 40000
dataPortCount: 64
singleConnection: true
"#,
        )
        .expect("parse");
        assert_eq!(config.r#type, "remote");
        assert_eq!(config.server_port, 9000);
        assert_eq!(config.data_port_count, 64);
        assert!(config.single_connection);
        assert_eq!(config.roots.len(), 2);
        assert_eq!(
            config.writable_root().expect("root"),
            PathBuf::from("/data/fdb")
        );
        assert_eq!(config.stores[0].name, "cluster");
    }

    #[test]
    fn home_expansion_leaves_plain_paths_alone() {
        assert_eq!(
            expand_home(Path::new("/data/fdb")),
            PathBuf::from("/data/fdb")
        );
    }
}
