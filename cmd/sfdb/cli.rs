use clap::{Parser, Subcommand};
use sfdb_common::{FdbError, Key, Request};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sfdb", about = "Structured fields database", version)]
pub struct Cli {
    /// Path to a YAML configuration file (defaults to FDB5_CONFIG /
    /// FDB5_CONFIG_FILE).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the network server.
    Server {
        /// Listen port, overriding the configured one.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Archive the contents of a file under a fully specified key.
    Archive {
        /// Key, e.g. class=od,stream=oper,date=20260801,type=fc,step=0
        key: String,
        /// File holding the field bytes.
        #[arg(long = "in")]
        input: PathBuf,
    },
    /// Retrieve one field into a file.
    Retrieve {
        key: String,
        /// Output file; stdout if omitted.
        #[arg(long = "out")]
        output: Option<PathBuf>,
    },
    /// List the fields matching a request.
    List {
        /// Request, e.g. class=od,step=0/6; empty matches everything.
        #[arg(default_value = "")]
        request: String,
        /// Collapse duplicates to the most recent field.
        #[arg(long)]
        dedup: bool,
    },
    /// Print databases, indexes and entries in detail.
    Dump {
        #[arg(default_value = "")]
        request: String,
    },
    /// Aggregate counts over the matching databases.
    Stats {
        #[arg(default_value = "")]
        request: String,
    },
    /// Per-database control status.
    Status {
        #[arg(default_value = "")]
        request: String,
    },
    /// Report (and with --doit remove) fields shadowed by later writes.
    Purge {
        #[arg(default_value = "")]
        request: String,
        #[arg(long)]
        doit: bool,
    },
    /// Delete the content selected by a request.
    Wipe {
        request: String,
        #[arg(long)]
        doit: bool,
        /// Proceed with a full wipe even when unaccounted files exist.
        #[arg(long)]
        unsafe_wipe_all: bool,
    },
}

/// Parses `name=value,...` into a request; values may list alternatives
/// separated by `/`.
pub fn parse_request(verb: &str, text: &str) -> Result<Request, FdbError> {
    Request::parse_params(verb, text).map_err(FdbError::Usage)
}

/// Parses a fully specified key: every keyword exactly one value.
pub fn parse_key(text: &str) -> Result<Key, FdbError> {
    let request = parse_request("archive", text)?;
    let mut key = Key::new();
    for name in request.names() {
        match request.values(name) {
            Some([value]) => key.insert(name, value.clone()),
            _ => {
                return Err(FdbError::usage(format!(
                    "keyword '{name}' must carry exactly one value"
                )))
            }
        }
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_requires_single_values() {
        let key = parse_key("class=od,step=0").expect("parse");
        assert_eq!(key.get("class"), Some("od"));
        assert!(parse_key("class=od/rd").is_err());
    }
}
