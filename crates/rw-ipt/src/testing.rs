//! In-memory stand-in for the kernel packet filter.

use crate::error::ExecError;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use rw_core::Family;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Table contents per family, keyed by table name, restored with
/// iptables-restore semantics: a payload replaces only the tables it names.
#[derive(Default)]
pub(crate) struct FakeKernel {
    tables: Mutex<[BTreeMap<String, Vec<String>>; 2]>,
    calls: Mutex<Vec<Invocation>>,
    fail_restore: AtomicBool,
    fail_dump: AtomicBool,
    fail_marker: Mutex<Option<String>>,
}

impl FakeKernel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_dump(family: Family, dump: &str) -> Self {
        let kernel = Self::new();
        kernel.load(family, dump);
        kernel
    }

    pub(crate) fn load(&self, family: Family, payload: &str) {
        let mut tables = self.tables.lock().unwrap();
        let family_tables = &mut tables[family.index()];

        let mut current: Option<(String, Vec<String>)> = None;
        for line in payload.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                current = Some((name.to_string(), vec![]));
            } else if line == "COMMIT" {
                if let Some((name, body)) = current.take() {
                    family_tables.insert(name, body);
                }
            } else if let Some((_, body)) = current.as_mut() {
                body.push(line.to_string());
            }
        }
    }

    pub(crate) fn dump(&self, family: Family) -> String {
        let tables = self.tables.lock().unwrap();
        let mut out = format!("# Generated by {}\n", family.save_program());
        for (name, body) in &tables[family.index()] {
            out.push_str(&format!("*{}\n", name));
            for line in body {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("COMMIT\n");
        }
        out
    }

    pub(crate) fn table_lines(&self, family: Family, table: &str) -> Vec<String> {
        let tables = self.tables.lock().unwrap();
        tables[family.index()].get(table).cloned().unwrap_or_default()
    }

    pub(crate) fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_dump(&self, fail: bool) {
        self.fail_dump.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_scripts_containing(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.program == "bash")
            .filter_map(|inv| inv.args.get(1).cloned())
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn failure(program: &str, stderr: &str) -> ExecError {
        ExecError::Failed {
            program: program.to_string(),
            status: "exit status: 1".to_string(),
            stderr: stderr.to_string(),
        }
    }
}

impl CommandRunner for FakeKernel {
    async fn run(
        &self,
        invocation: &Invocation,
        _timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        self.calls.lock().unwrap().push(invocation.clone());

        let program = invocation.program.as_str();
        let family = if program.starts_with("ip6") {
            Family::V6
        } else {
            Family::V4
        };

        match program {
            "iptables-save" | "ip6tables-save" => {
                if self.fail_dump.load(Ordering::SeqCst) {
                    return Err(Self::failure(program, "can't initialize iptables table"));
                }
                Ok(CommandOutput {
                    stdout: self.dump(family),
                    stderr: String::new(),
                })
            }
            "iptables-restore" | "ip6tables-restore" => {
                let path = invocation
                    .stdin_file
                    .as_ref()
                    .ok_or_else(|| Self::failure(program, "no input"))?;
                let payload = std::fs::read_to_string(path)?;
                if self.fail_restore.load(Ordering::SeqCst) {
                    return Err(Self::failure(program, "line 3 failed"));
                }
                self.load(family, &payload);
                Ok(CommandOutput::default())
            }
            "bash" => {
                let script = invocation.args.get(1).cloned().unwrap_or_default();
                let marker = self.fail_marker.lock().unwrap().clone();
                if marker.is_some_and(|m| script.contains(&m)) {
                    return Err(Self::failure(program, "Bad rule"));
                }
                Ok(CommandOutput::default())
            }
            other => Err(Self::failure(other, "command not found")),
        }
    }
}
