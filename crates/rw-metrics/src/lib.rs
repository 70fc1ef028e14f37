use anyhow::Result;
use axum::{Router, routing::get};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use rw_core::{CycleReport, FamilyOutcome, TableStatus};
use std::sync::Arc;
use tracing::info;

/// Metrics collector for ruleward
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Queue and table state
    queue_depth: IntGauge,
    chains_count: IntGaugeVec,
    rules_count: IntGaugeVec,

    // Cycle outcomes
    cycles: IntCounter,
    commits: IntCounterVec,
    commit_failures: IntCounterVec,
    fallback_rules: IntCounterVec,
    dump_failures: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let queue_depth = IntGauge::new(
            "ruleward_queue_depth",
            "Rule intents waiting for the next cycle",
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let chains_count = IntGaugeVec::new(
            Opts::new("ruleward_chains_count", "Number of declared chains"),
            &["family", "table"],
        )?;
        registry.register(Box::new(chains_count.clone()))?;

        let rules_count = IntGaugeVec::new(
            Opts::new("ruleward_rules_count", "Number of live rules"),
            &["family", "table"],
        )?;
        registry.register(Box::new(rules_count.clone()))?;

        let cycles = IntCounter::new(
            "ruleward_cycles_total",
            "Total reconciliation cycles",
        )?;
        registry.register(Box::new(cycles.clone()))?;

        let commits = IntCounterVec::new(
            Opts::new("ruleward_commits_total", "Total successful bulk loads"),
            &["family"],
        )?;
        registry.register(Box::new(commits.clone()))?;

        let commit_failures = IntCounterVec::new(
            Opts::new(
                "ruleward_commit_failures_total",
                "Total failed bulk loads",
            ),
            &["family"],
        )?;
        registry.register(Box::new(commit_failures.clone()))?;

        let fallback_rules = IntCounterVec::new(
            Opts::new(
                "ruleward_fallback_rules_total",
                "Rules replayed one at a time after a failed bulk load",
            ),
            &["family", "result"],
        )?;
        registry.register(Box::new(fallback_rules.clone()))?;

        let dump_failures = IntCounterVec::new(
            Opts::new(
                "ruleward_dump_failures_total",
                "Total failed ruleset dumps",
            ),
            &["family"],
        )?;
        registry.register(Box::new(dump_failures.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            chains_count,
            rules_count,
            cycles,
            commits,
            commit_failures,
            fallback_rules,
            dump_failures,
        })
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn update_table_metrics(&self, tables: &[TableStatus]) {
        for t in tables {
            let family = t.family.to_string();
            let labels = [family.as_str(), t.table.as_str()];
            self.chains_count
                .with_label_values(&labels)
                .set(t.chains as i64);
            self.rules_count
                .with_label_values(&labels)
                .set(t.rules as i64);
        }
    }

    /// Fold one cycle's outcome into the counters.
    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles.inc();

        for family in &report.families {
            let label = family.family.to_string();
            if !family.dump_ok {
                self.dump_failures.with_label_values(&[&label]).inc();
            }
            match family.outcome {
                FamilyOutcome::Unchanged => {}
                FamilyOutcome::Committed { .. } => {
                    self.commits.with_label_values(&[&label]).inc();
                }
                FamilyOutcome::FellBack { attempted, failed } => {
                    self.commit_failures.with_label_values(&[&label]).inc();
                    self.fallback_rules
                        .with_label_values(&[&label, "ok"])
                        .inc_by((attempted - failed) as u64);
                    self.fallback_rules
                        .with_label_values(&[&label, "failed"])
                        .inc_by(failed as u64);
                }
            }
        }

        self.update_table_metrics(&report.tables);
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// HTTP server for the Prometheus endpoint. The collector is shared with
/// whoever records cycles.
pub struct MetricsServer {
    collector: Arc<MetricsCollector>,
    addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn new(collector: Arc<MetricsCollector>, port: u16) -> Self {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Self { collector, addr }
    }

    pub fn router(&self) -> Router {
        let collector = self.collector.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                async move {
                    match collector.render_metrics() {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        )
    }

    pub async fn serve(self) -> Result<()> {
        let app = self.router();

        info!("Metrics server listening on http://{}/metrics", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
