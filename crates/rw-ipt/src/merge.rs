use crate::snapshot::TableState;
use rw_core::wire;
use rw_core::{Operation, RuleSpec};
use tracing::debug;

/// Merge queued intents for one (family, table) into its snapshot, in
/// submission order. Returns whether the table changed.
///
/// Identity is the essential form: a rule already present anywhere in the
/// table is not added again, and a delete tombstones the first live match
/// in place.
pub fn merge(state: &mut TableState, ops: &[RuleSpec]) -> bool {
    let mut changed = false;

    for op in ops {
        let Some(chain) = op.chain.as_deref() else {
            continue;
        };
        let essential = op.essential();
        debug!("Merging queued rule: {} {}", op.operation, essential);

        let touched = match op.operation {
            Operation::NewChain => {
                if state.chains.contains_key(chain) {
                    false
                } else {
                    state
                        .chains
                        .insert(chain.to_string(), wire::chain_declaration(chain));
                    true
                }
            }
            Operation::DestroyChain => {
                let removed = state.chains.remove(chain).is_some();
                let flushed = flush_chain(state, chain);
                removed || flushed
            }
            Operation::FlushChain => flush_chain(state, chain),
            Operation::Append => {
                if state.contains(&essential) {
                    false
                } else {
                    state.rules.push(Some(essential));
                    true
                }
            }
            Operation::Insert => {
                if state.contains(&essential) {
                    false
                } else {
                    state.rules.insert(0, Some(essential));
                    true
                }
            }
            Operation::Delete => {
                let position = state
                    .rules
                    .iter()
                    .position(|rule| rule.as_deref() == Some(essential.as_str()));
                match position {
                    Some(idx) => {
                        state.rules[idx] = None;
                        true
                    }
                    None => false,
                }
            }
        };

        changed |= touched;
    }

    changed
}

/// Tombstone every live rule of `chain`. Returns whether any rule matched.
pub fn flush_chain(state: &mut TableState, chain: &str) -> bool {
    let prefix = wire::chain_prefix(chain);
    let mut flushed = false;

    for slot in state.rules.iter_mut() {
        let in_chain = slot
            .as_deref()
            .is_some_and(|existing| existing.starts_with(&prefix));
        if in_chain {
            *slot = None;
            flushed = true;
        }
    }

    flushed
}
