// Copyright (C) 2024 Strangelove Ventures
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Optional on-disk configuration, mirroring `config/config.go`'s shape
//! (`ListenAddr`, `ChainNodes`) but in `toml` rather than the original's
//! YAML — the file format itself is left open by spec.md §6, and `toml`
//! keeps this crate's dependency stack aligned with the teacher's rather
//! than adding `serde_yaml` for a single file.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub chain_nodes: Vec<ChainNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainNode {
    pub priv_val_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Sentry addresses from the config file's chain node list, in file order.
    pub fn sentry_addresses(&self) -> Vec<String> {
        self.chain_nodes.iter().map(|n| n.priv_val_addr.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addr_and_chain_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
listen_addr = "tcp://0.0.0.0:1234"

[[chain_nodes]]
priv_val_addr = "tcp://sentry-1:1234"

[[chain_nodes]]
priv_val_addr = "tcp://sentry-2:1234"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_addr.as_deref(), Some("tcp://0.0.0.0:1234"));
        assert_eq!(
            config.sentry_addresses(),
            vec!["tcp://sentry-1:1234", "tcp://sentry-2:1234"]
        );
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
