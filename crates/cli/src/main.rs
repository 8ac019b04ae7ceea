use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use caravel_controller::ServiceController;
use caravel_core::{Error, ResourceMeta, Service};
use caravel_notifier::Notifier;
use caravel_platform::{HttpPlatformClient, PlatformClient};
use caravel_registry::Registry;
use caravel_store::Store;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "caravelctl", version, about = "Caravel declarative control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (default: "default"; empty matches all for list)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Embedded database path (overrides CARAVEL_DB_PATH)
    #[arg(long = "db", global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update a service from a YAML manifest
    Apply {
        /// Path to the manifest file
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// List services, or show one by name
    Get {
        /// Service name (all services when omitted)
        name: Option<String>,
    },
    /// Show a service in full, including conditions
    Describe {
        name: String,
    },
    /// Delete a service
    Delete {
        name: String,
    },
    /// Run the control-plane runtime: notifier plus service controller
    Run {
        /// Reconcile worker count (overrides CARAVEL_WORKERS)
        #[arg(long = "workers")]
        workers: Option<usize>,
        /// Platform API base URL (overrides CARAVEL_PLATFORM_URL)
        #[arg(long = "platform-url")]
        platform_url: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("CARAVEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CARAVEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CARAVEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// CLI exit codes: 0 success, 1 user/validation, 2 conflict, 3 not-found,
/// 4 transport/internal.
fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Invalid { .. } | Error::AlreadyExists(_) => 1,
        Error::Conflict(_) => 2,
        Error::NotFound(_) => 3,
        Error::Internal(_) | Error::Transport(_) | Error::Platform(_) => 4,
    }
}

fn db_path(cli: &Cli) -> String {
    if let Some(path) = &cli.db_path {
        return path.clone();
    }
    if let Ok(path) = std::env::var("CARAVEL_DB_PATH") {
        return path;
    }
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".caravel");
        let _ = std::fs::create_dir_all(&p);
        p.push("caravel.redb");
        return p.to_string_lossy().to_string();
    }
    "caravel.redb".to_string()
}

fn open_registry(cli: &Cli) -> Result<Arc<Registry>> {
    let path = db_path(cli);
    let store = Store::open(&path).with_context(|| format!("opening database at {}", path))?;
    Registry::new(Arc::new(store)).context("initializing registry")
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Err(e) = run_command(&cli).await {
        let code = match e.downcast_ref::<Error>() {
            Some(err) => {
                eprintln!("error: {}", err);
                exit_code(err)
            }
            None => {
                eprintln!("error: {:#}", e);
                1
            }
        };
        std::process::exit(code);
    }
}

async fn run_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Apply { file } => apply(cli, file),
        Commands::Get { name } => get(cli, name.as_deref()),
        Commands::Describe { name } => describe(cli, name),
        Commands::Delete { name } => {
            let registry = open_registry(cli)?;
            let ns = cli.namespace.as_deref().unwrap_or("default");
            registry.delete(ns, name)?;
            println!("service {}/{} deleted", ns, name);
            Ok(())
        }
        Commands::Run {
            workers,
            platform_url,
        } => run_runtime(cli, *workers, platform_url.clone()).await,
    }
}

fn apply(cli: &Cli, file: &str) -> Result<()> {
    let registry = open_registry(cli)?;
    let manifest = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let mut service: Service =
        serde_yaml::from_str(&manifest).with_context(|| format!("parsing {}", file))?;
    if let Some(ns) = &cli.namespace {
        service.metadata.namespace = ns.clone();
    }

    match registry.create(service.clone()) {
        Ok(stored) => {
            println!("service {} created (rv {})", stored.key(), stored.metadata.resource_version);
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            // Carry the user's spec over the stored object's version.
            let ns = if service.metadata.namespace.is_empty() {
                "default"
            } else {
                service.metadata.namespace.as_str()
            };
            let current = registry.get(ns, &service.metadata.name)?;
            service.metadata.resource_version = current.metadata.resource_version.clone();
            let stored = registry.update(service)?;
            println!("service {} updated (rv {})", stored.key(), stored.metadata.resource_version);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn get(cli: &Cli, name: Option<&str>) -> Result<()> {
    let registry = open_registry(cli)?;
    let services = match name {
        Some(name) => {
            let ns = cli.namespace.as_deref().unwrap_or("default");
            vec![registry.get(ns, name)?]
        }
        None => {
            let ns = cli.namespace.as_deref().unwrap_or("");
            registry.list(ns)?.0
        }
    };

    match cli.output {
        Output::Human => {
            println!(
                "{:<12} {:<20} {:>8} {:>8} {:>8}",
                "NAMESPACE", "NAME", "DESIRED", "READY", "AGE"
            );
            for svc in &services {
                println!(
                    "{:<12} {:<20} {:>8} {:>8} {:>8}",
                    svc.metadata.namespace,
                    svc.metadata.name,
                    svc.spec.intended_replicas(),
                    svc.status.ready_replicas,
                    render_age(&svc.metadata.creation_timestamp),
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&services)?),
    }
    Ok(())
}

fn describe(cli: &Cli, name: &str) -> Result<()> {
    let registry = open_registry(cli)?;
    let ns = cli.namespace.as_deref().unwrap_or("default");
    let svc = registry.get(ns, name)?;

    match cli.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&svc)?),
        Output::Human => {
            println!("{}", serde_yaml::to_string(&svc)?);
            if !svc.status.conditions.is_empty() {
                println!("{:<14} {:<8} {:<22} MESSAGE", "CONDITION", "STATUS", "REASON");
                for c in &svc.status.conditions {
                    println!(
                        "{:<14} {:<8} {:<22} {}",
                        c.r#type,
                        format!("{:?}", c.status),
                        c.reason,
                        c.message
                    );
                }
            }
        }
    }
    Ok(())
}

async fn run_runtime(cli: &Cli, workers: Option<usize>, platform_url: Option<String>) -> Result<()> {
    let registry = open_registry(cli)?;
    let workers = workers.unwrap_or_else(ServiceController::default_worker_count);
    let platform_url = platform_url
        .or_else(|| std::env::var("CARAVEL_PLATFORM_URL").ok())
        .context("no platform URL; pass --platform-url or set CARAVEL_PLATFORM_URL")?;

    let platform: Arc<dyn PlatformClient> = Arc::new(HttpPlatformClient::new(&platform_url)?);
    let notifier = Notifier::new(Arc::clone(&registry), Notifier::default_resync_interval());
    let controller = ServiceController::new(Arc::clone(&registry), platform, &notifier);

    info!(workers, platform = %platform_url, "caravel runtime starting");
    let (stop_tx, stop_rx) = watch::channel(false);
    let notifier_task = tokio::spawn(notifier.run(stop_rx.clone()));
    let controller_task = tokio::spawn(controller.run(workers, stop_rx));

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown signal received");
    let _ = stop_tx.send(true);
    registry.shutdown();

    if let Err(e) = controller_task.await {
        error!(error = %e, "controller task failed");
    }
    if let Err(e) = notifier_task.await {
        error!(error = %e, "notifier task failed");
    }
    info!("caravel runtime stopped");
    Ok(())
}

fn render_age(created: &Option<chrono::DateTime<chrono::Utc>>) -> String {
    let Some(created) = created else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now() - *created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_core::Strategy;

    #[test]
    fn exit_codes_follow_the_error_taxonomy() {
        assert_eq!(
            exit_code(&Error::Invalid {
                name: "x".into(),
                field_errors: vec![]
            }),
            1
        );
        assert_eq!(exit_code(&Error::AlreadyExists("k".into())), 1);
        assert_eq!(exit_code(&Error::Conflict("k".into())), 2);
        assert_eq!(exit_code(&Error::NotFound("k".into())), 3);
        assert_eq!(exit_code(&Error::Transport("down".into())), 4);
        assert_eq!(exit_code(&Error::Internal("io".into())), 4);
        assert_eq!(exit_code(&Error::Platform("quota".into())), 4);
    }

    #[test]
    fn manifest_parses_into_a_service() {
        let yaml = r#"
kind: Service
apiVersion: caravel.dev/v1
metadata:
  name: web
  namespace: default
spec:
  strategy:
    type: Dynamic
    replicas: 3
  template:
    image: nginx@1.25
"#;
        let svc: Service = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(svc.metadata.name, "web");
        assert_eq!(svc.spec.intended_replicas(), 3);
        assert!(matches!(svc.spec.strategy, Strategy::Dynamic { .. }));
    }
}
