use anyhow::Context;
use clap::{Parser, Subcommand};
use rw_core::status::display_tables;
use rw_core::{EngineConfig, Family, RuleDocument, load_rule_files};
use rw_ipt::{CommandRunner, Engine, StatusCollector, SystemRunner};
use rw_metrics::{MetricsCollector, MetricsServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "/etc/ruleward/ruleward.yaml";

#[derive(Parser)]
#[command(name = "ruleward")]
#[command(version, about = "iptables rule reconciliation", long_about = None)]
struct Cli {
    /// Engine configuration (defaults apply when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-table chain and rule counts of the live ruleset
    Dump {
        #[arg(long)]
        family: Option<Family>,
        #[arg(long)]
        json: bool,
    },
    /// Show what applying a rule document would change
    Plan {
        #[arg(short, long, default_value = "rules.yaml")]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Enqueue a rule document and run one reconciliation cycle
    Apply {
        #[arg(short, long, default_value = "rules.yaml")]
        file: PathBuf,
    },
    /// Reconcile the configured rule files periodically until interrupted
    Run,
    /// Metrics server
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Start metrics server
    Serve {
        #[arg(long, default_value = "9138")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Dump { family, json } => dump(&config, family, json).await?,
        Commands::Plan { file, json } => plan(config, &file, json).await?,
        Commands::Apply { file } => apply(config, &file).await?,
        Commands::Run => run(config).await?,
        Commands::Metrics { action } => handle_metrics_action(action).await?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            EngineConfig::from_file(Path::new(DEFAULT_CONFIG))
        }
        None => Ok(EngineConfig::default()),
    }
}

fn engine(config: EngineConfig) -> Engine<SystemRunner> {
    Engine::new(SystemRunner::new(config.use_sudo), config)
}

async fn dump(config: &EngineConfig, family: Option<Family>, json: bool) -> anyhow::Result<()> {
    let runner = SystemRunner::new(config.use_sudo);
    let collector = StatusCollector::new(&runner, config.command_timeout());

    let tables = match family {
        Some(family) => collector.collect_table_status(family).await?,
        None => collector.collect_all().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tables)?);
    } else {
        display_tables(&tables);
    }
    Ok(())
}

async fn plan(config: EngineConfig, file: &Path, json: bool) -> anyhow::Result<()> {
    let document = RuleDocument::from_file(file)?;
    let rules = document.specs()?;
    let plans = engine(config).plan(&rules).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    println!("📋 Planned {} rules from {}", rules.len(), file.display());
    for plan in &plans {
        if !plan.changed {
            println!("\n✅ IPv{}: no changes", plan.family);
            continue;
        }
        println!("\n📝 IPv{}:", plan.family);
        print!("{}", plan.diff());
    }
    Ok(())
}

async fn apply(config: EngineConfig, file: &Path) -> anyhow::Result<()> {
    let document = RuleDocument::from_file(file)?;
    let rules = document.specs()?;
    println!("🚀 Applying {} rules from {}", rules.len(), file.display());

    let mut engine = engine(config);
    for rule in &rules {
        engine
            .enqueue(rule)
            .with_context(|| format!("Rule rejected: {}", rule))?;
    }

    let report = engine.run_cycle().await;
    report.display();
    Ok(())
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let mut engine = engine(config);
    let loaded = engine.load_staged();
    if !loaded.is_empty() {
        info!("Seeded snapshots for {} families from staging", loaded.len());
    }

    let metrics = Arc::new(MetricsCollector::new()?);
    if let Some(port) = engine.config().metrics_port {
        let server = MetricsServer::new(metrics.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!("Metrics server stopped: {:#}", e);
            }
        });
    }

    reconcile(&mut engine, &metrics, tokio::signal::ctrl_c()).await;
    Ok(())
}

/// Re-assert the configured rule files and run a cycle every interval until
/// `shutdown` resolves. A shutdown raised mid-cycle stops the loop once that
/// cycle finishes.
async fn reconcile<R, S>(engine: &mut Engine<R>, metrics: &MetricsCollector, shutdown: S)
where
    R: CommandRunner,
    S: Future,
{
    let rule_files = engine.config().rule_files.clone();
    let mut interval = tokio::time::interval(engine.config().cycle_interval());
    info!(
        "Reconciling {} rule files every {:?}",
        rule_files.len(),
        engine.config().cycle_interval()
    );

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Interrupted, stopping");
                break;
            }
            _ = interval.tick() => {
                let rules = load_rule_files(&rule_files);
                let rejected = rules
                    .iter()
                    .filter(|rule| engine.enqueue(rule).is_err())
                    .count();
                if rejected > 0 {
                    warn!("{} rules rejected", rejected);
                }

                metrics.set_queue_depth(engine.pending());
                let report = engine.run_cycle().await;
                metrics.record_cycle(&report);
                metrics.set_queue_depth(engine.pending());
                if report.changed() {
                    report.display();
                }
            }
        }
    }
}

async fn handle_metrics_action(action: MetricsAction) -> anyhow::Result<()> {
    match action {
        MetricsAction::Serve { port } => {
            println!("🚀 Starting metrics server on port {}...", port);

            let collector = Arc::new(MetricsCollector::new()?);
            let server = MetricsServer::new(collector, port);
            server.serve().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_ipt::{CommandOutput, ExecError, Invocation};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Reports an empty ruleset and raises shutdown from inside the first
    /// cycle's dump.
    struct InterruptingRunner {
        interrupt: Mutex<Option<oneshot::Sender<()>>>,
        dumps: AtomicUsize,
    }

    impl CommandRunner for InterruptingRunner {
        async fn run(
            &self,
            invocation: &Invocation,
            _timeout: Duration,
        ) -> Result<CommandOutput, ExecError> {
            if invocation.program.ends_with("-save") {
                self.dumps.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = self.interrupt.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
            Ok(CommandOutput::default())
        }
    }

    #[tokio::test]
    async fn interrupt_during_cycle_stops_the_loop() {
        let (tx, rx) = oneshot::channel();
        let runner = InterruptingRunner {
            interrupt: Mutex::new(Some(tx)),
            dumps: AtomicUsize::new(0),
        };
        let mut engine = Engine::new(runner, EngineConfig::default());
        let metrics = MetricsCollector::new().unwrap();

        tokio::time::timeout(
            Duration::from_secs(10),
            reconcile(&mut engine, &metrics, rx),
        )
        .await
        .expect("loop kept running after interrupt");

        // one cycle, one dump per family
        assert_eq!(engine.runner().dumps.load(Ordering::SeqCst), 2);
    }
}
