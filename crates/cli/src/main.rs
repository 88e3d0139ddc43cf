use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ephem_apply::{Applier, ApplierConfig};
use ephem_core::{EnvironmentId, EnvironmentManifest, LifecycleResult, LifecycleStatus};
use ephem_kubehub::KubeCluster;
use ephem_lifecycle::{Orchestrator, DEFAULT_INGRESS_HOST};
use ephem_notify::{GitHubSink, LogSink, NotificationSink};
use ephem_render::Renderer;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

mod config;

use config::{load_manifest, DEFAULT_CONFIG_PATH};

/// Local port = service port + this offset in port-forward hints.
const PORT_FORWARD_OFFSET: u16 = 8000;

/// Written at DEBUG regardless of `--log-level`; `LOG_FILE=` disables it.
const DEFAULT_LOG_FILE: &str = "logs/ephemeral-env.log";

#[derive(Parser, Debug)]
#[command(name = "ephemctl", version, about = "Per-PR preview environments on Kubernetes")]
struct Cli {
    /// Log level (overridden by EPHEM_LOG filter directives)
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,

    #[arg(long = "log-format", value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Output format for the final result
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Do not post PR comments; log the result instead
    #[arg(long = "skip-github", global = true, action = ArgAction::SetTrue)]
    skip_github: bool,

    /// Host serving the ingress controller
    #[arg(long = "ingress-host", global = true, env = "EPHEM_INGRESS_HOST", default_value = DEFAULT_INGRESS_HOST)]
    ingress_host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Structured,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update the environment for a PR
    Create {
        pr: u64,
        /// Environment manifest (services list)
        #[arg(long = "config", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Directory of <kind>.yaml.hbs overrides
        #[arg(long = "templates")]
        templates: Option<PathBuf>,
    },
    /// Delete the environment for a PR
    Delete { pr: u64 },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Text => fmt.compact().with_target(false).boxed(),
        LogFormat::Structured => fmt.with_target(true).boxed(),
        LogFormat::Json => fmt.json().with_current_span(true).with_span_list(false).boxed(),
    }
}

/// `LOG_FILE` unset: default path. Set but empty: no file.
fn log_file_path(var: Option<String>) -> Option<PathBuf> {
    match var {
        None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        Some(v) if v.trim().is_empty() => None,
        Some(v) => Some(PathBuf::from(v)),
    }
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Stderr at the requested level, plus a DEBUG log file unless disabled.
/// The returned guard flushes the file writer when dropped.
fn init_tracing(level: &str, format: LogFormat) -> Option<WorkerGuard> {
    let directives = std::env::var("EPHEM_LOG").unwrap_or_else(|_| level.to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(format).with_filter(filter).boxed()];

    let mut guard = None;
    let mut file_error = None;
    if let Some(path) = log_file_path(std::env::var("LOG_FILE").ok()) {
        match open_log_file(&path) {
            Ok(file) => {
                let (writer, g) = tracing_appender::non_blocking(file);
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG)
                        .boxed(),
                );
                guard = Some(g);
            }
            Err(e) => file_error = Some((path, e)),
        }
    }

    tracing_subscriber::registry().with(layers).init();
    if let Some((path, e)) = file_error {
        warn!(path = %path.display(), error = %e, "log file disabled");
    }
    guard
}

fn exit_status(status: LifecycleStatus) -> u8 {
    match status {
        LifecycleStatus::Succeeded => 0,
        LifecycleStatus::Failed => 1,
        LifecycleStatus::PartiallyFailed => 2,
    }
}

fn exit_code(status: LifecycleStatus) -> ExitCode {
    ExitCode::from(exit_status(status))
}

fn pick_sink(skip_github: bool) -> Arc<dyn NotificationSink> {
    if skip_github {
        info!("GitHub integration skipped");
        return Arc::new(LogSink);
    }
    match GitHubSink::from_env() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!(error = %e, "GitHub integration unavailable; logging results only");
            Arc::new(LogSink)
        }
    }
}

fn print_result(output: Output, result: &LifecycleResult) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(result)?),
        Output::Human => {
            let env = result.environment.as_ref().map(|e| e.as_str()).unwrap_or("-");
            println!("{} {} • {}", result.operation, env, result.status);
            for (service, url) in &result.urls {
                println!("  {:<20} {}", service, url);
            }
            for e in &result.errors {
                println!("  ! {}", e);
            }
        }
    }
    Ok(())
}

fn log_access_hints(pr: u64, manifest: &EnvironmentManifest) {
    let Ok(env) = EnvironmentId::from_pr(pr) else { return };
    for svc in manifest.services() {
        info!(
            service = %svc.name,
            internal = %svc.internal_url(),
            port_forward = %svc.port_forward_hint(env.as_str(), PORT_FORWARD_OFFSET),
            "access"
        );
    }
}

async fn orchestrator(cli: &Cli, renderer: Renderer) -> Result<Orchestrator> {
    let cfg = ApplierConfig::from_env();
    let cluster = KubeCluster::connect(cfg.call_timeout).await.context("connecting to the cluster")?;
    let applier = Applier::new(Arc::new(cluster), cfg);
    Ok(Orchestrator::new(applier, renderer, pick_sink(cli.skip_github)).with_ingress_host(cli.ingress_host.clone()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.log_level, cli.log_format);

    let result = match &cli.command {
        Commands::Create { pr, config, templates } => {
            info!(pr, config = %config.display(), "create invoked");
            let manifest = match load_manifest(config) {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "configuration rejected");
                    eprintln!("error: {}", e);
                    return Ok(exit_code(LifecycleStatus::Failed));
                }
            };
            let renderer = match templates {
                Some(dir) => Renderer::from_dir(dir).with_context(|| format!("loading templates from {}", dir.display()))?,
                None => Renderer::builtin(),
            };
            let orch = orchestrator(&cli, renderer).await?;
            let result = orch.create(*pr, &manifest).await;
            if result.status != LifecycleStatus::Failed {
                log_access_hints(*pr, &manifest);
            }
            result
        }
        Commands::Delete { pr } => {
            info!(pr, "delete invoked");
            orchestrator(&cli, Renderer::builtin()).await?.delete(*pr).await
        }
    };

    print_result(cli.output, &result)?;
    Ok(exit_code(result.status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_with_defaults() {
        let cli = Cli::try_parse_from(["ephemctl", "create", "42"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(!cli.skip_github);
        match cli.command {
            Commands::Create { pr, config, templates } => {
                assert_eq!(pr, 42);
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
                assert!(templates.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ephemctl",
            "delete",
            "7",
            "--skip-github",
            "--log-format",
            "json",
            "--ingress-host",
            "10.0.0.5",
        ])
        .unwrap();
        assert!(cli.skip_github);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.ingress_host, "10.0.0.5");
        assert!(matches!(cli.command, Commands::Delete { pr: 7 }));
    }

    #[test]
    fn rejects_non_numeric_pr() {
        assert!(Cli::try_parse_from(["ephemctl", "delete", "abc"]).is_err());
    }

    #[test]
    fn log_file_defaults_and_can_be_disabled() {
        assert_eq!(log_file_path(None), Some(PathBuf::from(DEFAULT_LOG_FILE)));
        assert_eq!(log_file_path(Some(String::new())), None);
        assert_eq!(log_file_path(Some("  ".into())), None);
        assert_eq!(log_file_path(Some("/tmp/ephem.log".into())), Some(PathBuf::from("/tmp/ephem.log")));
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.log");
        open_log_file(&path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_status(LifecycleStatus::Succeeded), 0);
        assert_eq!(exit_status(LifecycleStatus::Failed), 1);
        assert_eq!(exit_status(LifecycleStatus::PartiallyFailed), 2);
    }
}
