use crate::error::ExecError;
use crate::runner::{CommandRunner, Invocation};
use anyhow::{Context, Result};
use rw_core::wire::{self, Line};
use rw_core::{Family, Operation, Table, TableStatus};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Run the family's save program and return its stdout.
pub async fn dump<R: CommandRunner>(
    runner: &R,
    family: Family,
    timeout: Duration,
) -> std::result::Result<String, ExecError> {
    let output = runner
        .run(&Invocation::new(family.save_program()), timeout)
        .await?;
    Ok(output.stdout)
}

/// In-memory mirror of one kernel table.
///
/// `rules` holds essential forms in evaluation order. A deleted rule becomes
/// `None` in place so positions observed in the dump stay stable until the
/// table is serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    pub chains: BTreeMap<String, String>,
    pub rules: Vec<Option<String>>,
}

impl TableState {
    pub fn live_rules(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().flatten().map(String::as_str)
    }

    pub fn contains(&self, essential: &str) -> bool {
        self.live_rules().any(|rule| rule == essential)
    }

    pub fn tombstones(&self) -> usize {
        self.rules.iter().filter(|r| r.is_none()).count()
    }

    /// Chain declarations followed by live rules as `-A` lines, without the
    /// table header and commit marker.
    pub fn body_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.chains.values().cloned().collect();
        lines.extend(
            self.live_rules()
                .map(|rule| wire::rule_line(Operation::Append, rule)),
        );
        lines
    }
}

/// All managed tables of one address family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyState {
    tables: [TableState; 4],
}

impl FamilyState {
    pub fn table(&self, table: Table) -> &TableState {
        &self.tables[table.index()]
    }

    pub fn table_mut(&mut self, table: Table) -> &mut TableState {
        &mut self.tables[table.index()]
    }

    /// Replace the state of every managed table present in `dump`.
    ///
    /// Tables missing from the dump keep their previous state; tables the
    /// engine does not manage are skipped.
    pub fn apply_dump(&mut self, family: Family, dump: &str) -> Vec<Table> {
        let mut seen = Vec::new();
        let mut current: Option<Table> = None;
        let mut skipping = false;

        for raw in dump.lines() {
            let Some(line) = wire::classify(raw) else {
                continue;
            };

            match line {
                Line::TableHeader(name) => match Table::parse(name) {
                    Some(table) => {
                        *self.table_mut(table) = TableState::default();
                        seen.push(table);
                        current = Some(table);
                        skipping = false;
                    }
                    None => {
                        warn!("Skipping unsupported table {} for IPv{}", name, family);
                        current = None;
                        skipping = true;
                    }
                },
                Line::Commit => {
                    current = None;
                    skipping = false;
                }
                _ if skipping => {}
                Line::ChainDeclaration { name, line } => {
                    if let Some(table) = current {
                        self.table_mut(table)
                            .chains
                            .insert(name.to_string(), line.to_string());
                    }
                }
                Line::NewChain(name) => {
                    if let Some(table) = current {
                        self.table_mut(table)
                            .chains
                            .insert(name.to_string(), wire::chain_declaration(name));
                    }
                }
                Line::DestroyChain(name) => {
                    if let Some(table) = current {
                        self.table_mut(table).chains.remove(name);
                    }
                }
                Line::Append(essential) => {
                    if let Some(table) = current {
                        self.table_mut(table)
                            .rules
                            .push(Some(essential.to_string()));
                    }
                }
                Line::Insert(essential) => {
                    if let Some(table) = current {
                        self.table_mut(table)
                            .rules
                            .insert(0, Some(essential.to_string()));
                    }
                }
                Line::Other(other) => {
                    debug!("Ignoring dump line for IPv{}: {}", family, other);
                }
            }
        }

        debug!(
            "Parsed IPv{} dump: {}",
            family,
            self.status(family)
                .iter()
                .map(|t| format!("{}={}/{}", t.table, t.chains, t.rules))
                .collect::<Vec<_>>()
                .join(" ")
        );

        seen
    }

    /// Parse a previously staged restore payload.
    pub fn load_file(&mut self, family: Family, path: &Path) -> Result<Vec<Table>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read staged ruleset {:?}", path))?;
        Ok(self.apply_dump(family, &content))
    }

    /// Restore payload: each non-empty table in fixed order, chain
    /// declarations first, then live rules, then `COMMIT`. Empty tables are
    /// omitted so the bulk load leaves them untouched.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for table in Table::ALL {
            let body = self.table(table).body_lines();
            if body.is_empty() {
                continue;
            }
            lines.push(wire::table_header(table));
            lines.extend(body);
            lines.push(wire::COMMIT.to_string());
        }

        if lines.is_empty() {
            return String::new();
        }
        lines.join("\n") + "\n"
    }

    pub fn status(&self, family: Family) -> Vec<TableStatus> {
        Table::ALL
            .into_iter()
            .map(|table| {
                let state = self.table(table);
                TableStatus {
                    family,
                    table,
                    chains: state.chains.len(),
                    rules: state.live_rules().count(),
                    tombstones: state.tombstones(),
                }
            })
            .collect()
    }
}
