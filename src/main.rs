//! Binary entry point for the stratus CLI.

use std::env;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stratus::{
    ClusterConfig, ClusterSettings, ClusterTeardown, ConfigError, DeployError, DeploymentReport,
    Orchestrator, ReportError, ScalewayConfig, ScalewayProvider, ScalewayProviderError,
    SshExecutor, TcpPortCheck, TeardownError, expand_tilde, load_properties, remote_env,
    remove_stale_artifact, verify_distribution,
};

mod cli;

use cli::{ApplyEnvCommand, Cli, DeployCommand, TeardownCommand};

/// Exit status used when the deployment completed but some nodes failed.
const PARTIAL_FAILURE_EXIT: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider error: {0}")]
    Provider(#[from] ScalewayProviderError),
    #[error("ssh setup failed: {0}")]
    Remote(String),
    #[error("deployment failed: {0}")]
    Deploy(#[from] DeployError<ScalewayProviderError>),
    #[error("teardown failed: {0}")]
    Teardown(#[from] TeardownError<ScalewayProviderError>),
    #[error("report failed: {0}")]
    Report(#[from] ReportError),
    #[error("apply-env failed: {0}")]
    ApplyEnv(#[from] remote_env::RemoteEnvError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        writeln!(io::stderr(), "failed to initialise logging: {err}").ok();
    }
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("stratus=info".parse()?))
        .with_writer(io::stderr)
        .try_init()
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Deploy(command) => deploy(&command).await,
        Cli::Teardown(command) => teardown(command).await,
        Cli::ApplyEnv(command) => apply_env(&command),
    }
}

fn load_settings() -> Result<(ScalewayConfig, ClusterSettings), CliError> {
    let scaleway = ScalewayConfig::load_without_cli_args()?;
    let settings = ClusterSettings::load_without_cli_args()?;
    Ok((scaleway, settings))
}

/// Applies command-line overrides and fills in the payload default.
fn apply_overrides(settings: &mut ClusterSettings, args: &DeployCommand) {
    if let Some(name) = &args.cluster_name {
        settings.cluster_name.clone_from(name);
    }
    if let Some(count) = args.containers {
        settings.container_count = count;
    }
    if settings.payload_path.is_none() {
        settings.payload_path = env::current_exe()
            .ok()
            .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
            .map(Utf8PathBuf::into_string);
    }
}

async fn deploy(args: &DeployCommand) -> Result<i32, CliError> {
    let (scaleway, mut settings) = load_settings()?;
    apply_overrides(&mut settings, args);
    let properties = settings
        .properties_file
        .as_deref()
        .map(load_properties)
        .transpose()?
        .unwrap_or_default();
    let config = ClusterConfig::from_settings(&settings, &scaleway, properties)?;

    if args.skip_preflight {
        info!("distribution pre-flight skipped");
    } else {
        verify_distribution(&config.distribution).await?;
    }

    let artifact_dir = Utf8Path::new(&args.artifact_dir);
    remove_stale_artifact(artifact_dir)?;

    let provider = ScalewayProvider::new(&scaleway)?;
    let executor = SshExecutor::with_process_runner(&config)
        .map_err(|err| CliError::Remote(err.to_string()))?;
    let ports = config.ports;
    let orchestrator = Orchestrator::new(Arc::new(config), provider, executor, TcpPortCheck::default());
    let results = orchestrator.deploy().await?;

    let report = DeploymentReport::new(&results, &ports);
    let mut stdout = io::stdout();
    for line in report.summary_lines() {
        writeln!(stdout, "{line}").map_err(|err| CliError::Output(err.to_string()))?;
    }
    let path = report.write_artifact(artifact_dir)?;
    info!(path = %path, "server listing written");

    if report.all_succeeded() {
        Ok(0)
    } else {
        warn!("one or more nodes failed to deploy");
        Ok(PARTIAL_FAILURE_EXIT)
    }
}

async fn teardown(args: TeardownCommand) -> Result<i32, CliError> {
    let (scaleway, settings) = load_settings()?;
    let name = args.cluster_name.unwrap_or(settings.cluster_name);
    let provider = ScalewayProvider::new(&scaleway)?;
    let summary = ClusterTeardown::new(provider, scaleway.default_zone)
        .run(&name)
        .await?;

    let mut stdout = io::stdout();
    for id in &summary.terminated {
        writeln!(stdout, "terminated {id}").map_err(|err| CliError::Output(err.to_string()))?;
    }
    Ok(0)
}

fn apply_env(args: &ApplyEnvCommand) -> Result<i32, CliError> {
    let entries = remote_env::parse_env_args(&args.entries)?;
    let profile = Utf8PathBuf::from(expand_tilde(&args.profile));
    remote_env::apply_env(&profile, &entries)?;
    writeln!(io::stdout(), "Complete").map_err(|err| CliError::Output(err.to_string()))?;
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
