//! Template Operator - Main Entry Point

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use template_operator::config::ConfigError;
use template_operator::crd::parse_interval;
use template_operator::{ControllerConfig, KubeStore, ObjectTemplate, controller, health};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// ObjectTemplate controller
#[derive(Parser, Debug)]
#[command(name = "template-operator")]
#[command(version)]
#[command(about = "Renders ObjectTemplate matrices into Kubernetes resources", long_about = None)]
struct Args {
    /// Field manager name used for server-side apply
    #[arg(
        long,
        env = "TEMPLATE_CONTROLLER_FIELD_MANAGER",
        default_value = "template-controller"
    )]
    pub field_manager: String,

    /// Maximum number of ObjectTemplates reconciled in parallel
    #[arg(
        long,
        env = "TEMPLATE_CONTROLLER_MAX_CONCURRENT_RECONCILES",
        default_value_t = 4
    )]
    pub max_concurrent_reconciles: usize,

    /// Maximum number of renders, applies or deletes in flight per pass
    #[arg(long, env = "TEMPLATE_CONTROLLER_MAX_PARALLELISM", default_value_t = 32)]
    pub max_parallelism: usize,

    /// Requeue delay after a pass failed to read or update its ObjectTemplate
    #[arg(
        long,
        env = "TEMPLATE_CONTROLLER_ERROR_REQUEUE",
        default_value = "30s",
        value_parser = parse_duration
    )]
    pub error_requeue: Duration,

    /// Only reconcile ObjectTemplates in this namespace
    #[arg(long, env = "TEMPLATE_CONTROLLER_NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to kubeconfig file
    #[arg(long, env = "TEMPLATE_CONTROLLER_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[arg(long, env = "TEMPLATE_CONTROLLER_CONTEXT")]
    pub context: Option<String>,

    /// Address the liveness and readiness probes bind to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Print the ObjectTemplate CRD as YAML and exit
    #[arg(long, env = "PRINT_CRD")]
    pub print_crd: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    parse_interval(value).map_err(|e| e.to_string())
}

impl Args {
    fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let mut builder = ControllerConfig::builder()
            .field_manager(&self.field_manager)
            .max_concurrent_reconciles(self.max_concurrent_reconciles)
            .max_parallelism(self.max_parallelism)
            .error_requeue(self.error_requeue);
        if let Some(namespace) = &self.namespace {
            builder = builder.namespace(namespace);
        }
        if let Some(path) = &self.kubeconfig {
            builder = builder.kubeconfig_path(path);
        }
        if let Some(context) = &self.context {
            builder = builder.context(context);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&ObjectTemplate::crd())?);
        return Ok(());
    }

    let log_level = match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Template Operator");

    let config = args
        .controller_config()
        .context("Invalid controller configuration")?;
    info!(
        field_manager = %config.field_manager,
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        max_parallelism = config.max_parallelism,
        "Controller configuration"
    );

    let client = KubeStore::create_client(&config)
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes");
    let store = Arc::new(KubeStore::new(client));

    let probe_addr = args.health_probe_bind_address;
    let index = store.index();
    tokio::spawn(async move {
        if let Err(e) = health::serve(probe_addr, index).await {
            error!(error = %e, "Health probe server failed");
        }
    });

    controller::run(store, config).await;
    info!("Shutting down operator...");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_build_controller_config() {
        let args = Args::try_parse_from([
            "template-operator",
            "--field-manager",
            "custom-manager",
            "--max-concurrent-reconciles",
            "8",
            "--max-parallelism",
            "2",
            "--error-requeue",
            "1m30s",
            "--namespace",
            "apps",
            "--context",
            "staging",
        ])
        .unwrap();

        let config = args.controller_config().unwrap();
        assert_eq!(config.field_manager, "custom-manager");
        assert_eq!(config.max_concurrent_reconciles, 8);
        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.error_requeue, Duration::from_secs(90));
        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert_eq!(config.kubeconfig_path, None);
        assert_eq!(config.context.as_deref(), Some("staging"));
    }

    #[test]
    fn test_invalid_flags_are_rejected() {
        assert!(
            Args::try_parse_from(["template-operator", "--error-requeue", "soon"]).is_err()
        );

        let args =
            Args::try_parse_from(["template-operator", "--max-parallelism", "0"]).unwrap();
        assert!(args.controller_config().is_err());
    }
}
