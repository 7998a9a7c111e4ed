//! Command-line interface definitions for the `stratus` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `stratus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    about = "Provision and configure a multi-role application cluster on Scaleway",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision instances, configure them over SSH and report the outcome.
    #[command(name = "deploy", about = "Provision and configure a cluster")]
    Deploy(DeployCommand),
    /// Terminate every instance tagged with the cluster name.
    #[command(name = "teardown", about = "Terminate every instance of a cluster")]
    Teardown(TeardownCommand),
    /// Write `--KEY=value` pairs as exports to a profile (runs on nodes).
    #[command(
        name = "apply-env",
        about = "Write environment exports to a login profile"
    )]
    ApplyEnv(ApplyEnvCommand),
}

/// Arguments for the `stratus deploy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeployCommand {
    /// Override the cluster name from configuration.
    #[arg(long, value_name = "NAME")]
    pub(crate) cluster_name: Option<String>,
    /// Override the number of container nodes for a multi-node cluster.
    #[arg(long, value_name = "COUNT")]
    pub(crate) containers: Option<u32>,
    /// Skip the HTTP check of the distribution URL.
    #[arg(long)]
    pub(crate) skip_preflight: bool,
    /// Directory receiving the `stratus-servers.csv` listing.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub(crate) artifact_dir: String,
}

/// Arguments for the `stratus teardown` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TeardownCommand {
    /// Cluster to terminate; defaults to the configured cluster name.
    #[arg(long, value_name = "NAME")]
    pub(crate) cluster_name: Option<String>,
}

/// Arguments for the `stratus apply-env` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ApplyEnvCommand {
    /// Profile file receiving the exports.
    #[arg(long, value_name = "PATH", default_value = "~/.bashrc")]
    pub(crate) profile: String,
    /// Entries of the form `--KEY=value`.
    #[arg(
        value_name = "--KEY=VALUE",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub(crate) entries: Vec<String>,
}
