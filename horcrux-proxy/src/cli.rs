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

//! CLI surface for the `start` subcommand (spec.md §6). A single flat
//! command rather than cobra's command tree: the only subcommand the
//! original ships is `start` (plus a `config init` helper we fold into
//! `--listen`/`--sentry` defaults instead of a separate config file writer).

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "horcrux-proxy", author, version, about = "A Tendermint/CometBFT remote-signing proxy")]
pub struct Cli {
    /// Addresses to bind for upstream signer-listener endpoints (horcrux dials in).
    #[arg(long = "listen", short = 'l', env = "HORCRUX_PROXY_LISTEN")]
    pub listen: Vec<String>,

    /// Persistent sentry addresses to dial and serve forever.
    #[arg(long = "sentry", short = 's', env = "HORCRUX_PROXY_SENTRY")]
    pub sentry: Vec<String>,

    /// Use the gRPC upstream (a horcrux cluster) instead of the listener pool.
    #[arg(long = "grpc", short = 'g', env = "HORCRUX_PROXY_GRPC")]
    pub grpc: Option<String>,

    /// Enable Kubernetes-based sentry discovery. Takes an explicit value
    /// (`--operator true` / `--operator false`, matching the original
    /// `pflag.BoolP` flag's `--operator=false` form) rather than clap's
    /// default zero-arg `SetTrue` action, since spec.md §4.6's
    /// persistent-signers-only mode must be reachable from the CLI, not only
    /// via the `HORCRUX_PROXY_OPERATOR` env var.
    #[arg(
        long = "operator",
        short = 'o',
        env = "HORCRUX_PROXY_OPERATOR",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub operator: bool,

    /// Accept sentries on all nodes rather than just the local node.
    #[arg(long = "all", short = 'a', env = "HORCRUX_PROXY_ALL", default_value_t = false)]
    pub all: bool,

    /// Additional label selectors narrowing Kubernetes sentry discovery.
    #[arg(long = "label", short = 'L', env = "HORCRUX_PROXY_LABEL")]
    pub label: Vec<String>,

    /// Maximum frame size accepted on the sentry-facing path, in bytes.
    #[arg(long = "max-read-size", env = "HORCRUX_PROXY_MAX_READ_SIZE", default_value_t = 1024 * 1024)]
    pub max_read_size: usize,

    /// One of debug, info, warn, error.
    #[arg(long = "log-level", env = "HORCRUX_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Optional on-disk config file (see `config.rs`); CLI flags override it.
    #[arg(long = "config", env = "HORCRUX_PROXY_CONFIG")]
    pub config: Option<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_operator_mode_and_local_node_only() {
        let cli = Cli::parse_from(["horcrux-proxy"]);
        assert!(cli.operator);
        assert!(!cli.all);
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.max_read_size, 1024 * 1024);
    }

    #[test]
    fn operator_can_be_disabled_explicitly_from_the_cli() {
        let cli = Cli::parse_from(["horcrux-proxy", "--operator", "false"]);
        assert!(!cli.operator);

        let cli = Cli::parse_from(["horcrux-proxy", "--operator", "true"]);
        assert!(cli.operator);
    }

    #[test]
    fn repeatable_flags_collect_into_vecs() {
        let cli = Cli::parse_from([
            "horcrux-proxy",
            "--sentry",
            "tcp://sentry-1:1234",
            "--sentry",
            "tcp://sentry-2:1234",
            "--listen",
            "tcp://0.0.0.0:1234",
        ]);
        assert_eq!(cli.sentry, vec!["tcp://sentry-1:1234", "tcp://sentry-2:1234"]);
        assert_eq!(cli.listen, vec!["tcp://0.0.0.0:1234"]);
    }
}
