use rw_core::{Family, RuleError, RuleSpec, Table};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

/// Rule intents grouped per (family, table), in submission order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    lists: [[Vec<RuleSpec>; 4]; 2],
}

impl Batch {
    pub fn push(&mut self, rule: RuleSpec) {
        self.lists[rule.family.index()][rule.table.index()].push(rule);
    }

    pub fn ops(&self, family: Family, table: Table) -> &[RuleSpec] {
        &self.lists[family.index()][table.index()]
    }

    /// Every op of one family, tables in payload order.
    pub fn family_ops(&self, family: Family) -> impl Iterator<Item = &RuleSpec> {
        self.lists[family.index()].iter().flatten()
    }

    pub fn family_len(&self, family: Family) -> usize {
        self.lists[family.index()].iter().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        Family::ALL.into_iter().map(|f| self.family_len(f)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<RuleSpec> for Batch {
    fn from_iter<I: IntoIterator<Item = RuleSpec>>(iter: I) -> Self {
        let mut batch = Batch::default();
        for rule in iter {
            batch.push(rule);
        }
        batch
    }
}

#[derive(Debug, Default)]
struct Pending {
    batch: Batch,
    len: usize,
    warned: bool,
}

/// Intents submitted since the last reconciliation cycle.
///
/// Cheap to clone; every clone feeds the same queue, so producers can hold
/// their own handle while a cycle is running. `drain` swaps the whole batch
/// out under the lock, so a concurrent `enqueue` lands entirely in either the
/// drained batch or the next one.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    inner: Arc<Mutex<Pending>>,
    warn_threshold: usize,
}

impl PendingQueue {
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Pending::default())),
            warn_threshold,
        }
    }

    /// Queue a copy of `rule`. Malformed rules are logged and dropped.
    pub fn enqueue(&self, rule: &RuleSpec) -> Result<(), RuleError> {
        if let Err(e) = rule.validate() {
            error!("Dropping rule {}: {}", rule, e);
            return Err(e);
        }

        let mut pending = self.lock();
        pending.batch.push(rule.clone());
        pending.len += 1;

        if pending.len >= self.warn_threshold && !pending.warned {
            pending.warned = true;
            warn!(
                "Pending rule queue reached {} entries (threshold {})",
                pending.len, self.warn_threshold
            );
        }
        Ok(())
    }

    pub fn drain(&self) -> Batch {
        let mut pending = self.lock();
        std::mem::take(&mut *pending).batch
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.drain();
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
