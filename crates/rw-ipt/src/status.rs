use crate::runner::CommandRunner;
use crate::snapshot::{self, FamilyState};
use anyhow::{Context, Result};
use rw_core::{Family, TableStatus};
use std::time::Duration;

/// Per-table chain and live-rule counts of a snapshot.
pub fn table_status(family: Family, state: &FamilyState) -> Vec<TableStatus> {
    state.status(family)
}

/// Reads live table status straight from the kernel, without touching any
/// engine state.
pub struct StatusCollector<'a, R> {
    runner: &'a R,
    timeout: Duration,
}

impl<'a, R: CommandRunner> StatusCollector<'a, R> {
    pub fn new(runner: &'a R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub async fn snapshot(&self, family: Family) -> Result<FamilyState> {
        let output = snapshot::dump(self.runner, family, self.timeout)
            .await
            .with_context(|| format!("Failed to dump iptables v{}", family))?;

        let mut state = FamilyState::default();
        state.apply_dump(family, &output);
        Ok(state)
    }

    pub async fn collect_table_status(&self, family: Family) -> Result<Vec<TableStatus>> {
        let state = self.snapshot(family).await?;
        Ok(table_status(family, &state))
    }

    /// Both families; a family whose dump fails contributes no rows.
    pub async fn collect_all(&self) -> Vec<TableStatus> {
        let (v4, v6) = tokio::join!(
            self.collect_table_status(Family::V4),
            self.collect_table_status(Family::V6)
        );

        let mut tables = vec![];
        for result in [v4, v6] {
            match result {
                Ok(rows) => tables.extend(rows),
                Err(e) => tracing::warn!("{:#}", e),
            }
        }
        tables
    }
}
