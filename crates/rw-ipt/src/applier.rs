use crate::error::CommitError;
use crate::queue::Batch;
use crate::runner::{CommandRunner, Invocation};
use crate::snapshot::FamilyState;
use rw_core::{EngineConfig, Family};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackReport {
    pub attempted: usize,
    pub failed: usize,
}

/// Writes reconciled state back to the kernel.
pub struct Applier<'a, R> {
    runner: &'a R,
    config: &'a EngineConfig,
}

impl<'a, R: CommandRunner> Applier<'a, R> {
    pub fn new(runner: &'a R, config: &'a EngineConfig) -> Self {
        Self { runner, config }
    }

    /// Stage the family's payload and bulk-load it atomically. Returns the
    /// number of payload lines.
    pub async fn commit(&self, family: Family, state: &FamilyState) -> Result<usize, CommitError> {
        let payload = state.render();
        let path = self.config.staging_path(family);

        let stage = |source| CommitError::Stage {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.config.staging_dir)
            .await
            .map_err(stage)?;
        tokio::fs::write(&path, &payload).await.map_err(stage)?;

        let restore = Invocation::new(family.restore_program()).stdin_file(&path);
        debug!("{} bytes={}", restore, payload.len());
        self.runner
            .run(&restore, self.config.command_timeout())
            .await?;

        let lines = payload.lines().count();
        info!("iptables v{} restored {} lines", family, lines);
        Ok(lines)
    }

    /// Replay this cycle's queued ops for `family` one at a time through
    /// their existence-checked commands. Failures are logged and skipped.
    pub async fn fallback(&self, family: Family, batch: &Batch) -> FallbackReport {
        let mut report = FallbackReport::default();

        for rule in batch.family_ops(family) {
            report.attempted += 1;
            let script = rule.command(rule.operation);
            let result = self
                .runner
                .run(&Invocation::shell(script), self.config.command_timeout())
                .await;
            if let Err(e) = result {
                report.failed += 1;
                error!("Failed to execute individual rule {}: {}", rule, e);
            }
        }

        info!(
            "Executed {} queued rules individually for v{} ({} failed)",
            report.attempted, family, report.failed
        );
        report
    }
}
