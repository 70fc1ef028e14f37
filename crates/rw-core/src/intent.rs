use crate::error::RuleError;
use crate::model::{Family, Operation, Table};
use crate::rule::RuleSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A YAML document of rule intents.
///
/// ```yaml
/// rules:
///   - table: nat
///     chain: FW_NTP_REDIRECT
///     op: new_chain
///   - table: nat
///     chain: FW_PREROUTING
///     protocol: udp
///     dport: "123"
///     jump: FW_NTP_REDIRECT
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub rules: Vec<RuleIntent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleIntent {
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub table: Table,
    pub chain: Option<String>,
    #[serde(default)]
    pub op: Operation,
    pub protocol: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub sport: Option<String>,
    pub dport: Option<String>,
    #[serde(default)]
    pub sets: Vec<SetMatch>,
    #[serde(default)]
    pub modules: Vec<ModuleMatch>,
    pub comment: Option<String>,
    pub jump: Option<String>,
    pub log_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMatch {
    pub name: String,
    pub dirs: String,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMatch {
    pub module: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub negate: bool,
}

impl RuleIntent {
    /// Build and validate the rule this intent describes. Match fields are
    /// applied in the order a dump prints them.
    pub fn to_spec(&self) -> std::result::Result<RuleSpec, RuleError> {
        let mut rule = RuleSpec::new(self.table)
            .family(self.family)
            .operation(self.op);

        if let Some(chain) = &self.chain {
            rule = rule.chain(chain);
        }
        if let Some(source) = &self.source {
            rule = match source.strip_prefix('!') {
                Some(addr) => rule.not_source(addr.trim()),
                None => rule.source(source),
            };
        }
        if let Some(destination) = &self.destination {
            rule = match destination.strip_prefix('!') {
                Some(addr) => rule.not_destination(addr.trim()),
                None => rule.destination(destination),
            };
        }
        if let Some(iface) = &self.in_interface {
            rule = rule.in_interface(iface);
        }
        if let Some(iface) = &self.out_interface {
            rule = rule.out_interface(iface);
        }
        if let Some(protocol) = &self.protocol {
            rule = rule.protocol(protocol);
        }
        if let Some(port) = &self.sport {
            rule = rule.sport(port);
        }
        if let Some(port) = &self.dport {
            rule = rule.dport(port);
        }
        for set in &self.sets {
            rule = rule.match_set(&set.name, &set.dirs, set.negate);
        }
        for m in &self.modules {
            rule = if m.negate {
                rule.not_module(&m.module, &m.options)
            } else {
                rule.module(&m.module, &m.options)
            };
        }
        if let Some(comment) = &self.comment {
            rule = rule.comment(comment);
        }
        if let Some(prefix) = &self.log_prefix {
            rule = rule.log(prefix);
        } else if let Some(target) = &self.jump {
            rule = rule.jump(target);
        }

        rule.validate()?;
        Ok(rule)
    }
}

impl TryFrom<&RuleIntent> for RuleSpec {
    type Error = RuleError;

    fn try_from(intent: &RuleIntent) -> std::result::Result<Self, Self::Error> {
        intent.to_spec()
    }
}

impl RuleDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse rule document YAML")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule document from {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid rule document {:?}", path))
    }

    pub fn specs(&self) -> Result<Vec<RuleSpec>> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, intent)| {
                intent
                    .to_spec()
                    .with_context(|| format!("Rule #{} is invalid", i + 1))
            })
            .collect()
    }
}

/// Load every rule from a list of documents or directories of documents.
/// Unreadable documents are skipped with a warning so one bad file does not
/// stop the rest from being re-asserted.
pub fn load_rule_files(paths: &[PathBuf]) -> Vec<RuleSpec> {
    let mut rules = Vec::new();

    for path in paths {
        for file in expand_path(path) {
            match RuleDocument::from_file(&file).and_then(|doc| doc.specs()) {
                Ok(specs) => rules.extend(specs),
                Err(e) => warn!("Skipping rule document {:?}: {:#}", file, e),
            }
        }
    }

    rules
}

fn expand_path(path: &Path) -> Vec<PathBuf> {
    if !path.is_dir() {
        return vec![path.to_path_buf()];
    }

    let mut files = Vec::new();
    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let file = entry.path();
                let ext = file.extension().and_then(|s| s.to_str());
                if ext == Some("yaml") || ext == Some("yml") {
                    files.push(file);
                }
            }
        }
        Err(e) => warn!("Failed to read rule directory {:?}: {}", path, e),
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_builds_rules_in_order() {
        let yaml = r#"
rules:
  - table: nat
    chain: FW_NTP_REDIRECT
    op: new_chain
  - table: nat
    chain: FW_PREROUTING
    protocol: udp
    dport: "123"
    jump: FW_NTP_REDIRECT
  - family: 6
    chain: FW_DROP
    source: "!fd00::/64"
    sets:
      - name: monitored_net_set
        dirs: src,src
    comment: ap acl off
    jump: RETURN
"#;
        let specs = RuleDocument::from_yaml(yaml).unwrap().specs().unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].operation, Operation::NewChain);
        assert_eq!(
            specs[1].essential(),
            "FW_PREROUTING -p udp -m udp --dport 123 -j FW_NTP_REDIRECT"
        );
        assert_eq!(specs[2].family, Family::V6);
        assert_eq!(
            specs[2].essential(),
            "FW_DROP ! -s fd00::/64 -m set --match-set monitored_net_set src,src \
             -m comment --comment \"ap acl off\" -j RETURN"
        );
    }

    #[test]
    fn invalid_rule_is_reported_with_position() {
        let yaml = r#"
rules:
  - chain: FW_OK
    jump: ACCEPT
  - table: filter
    jump: DROP
"#;
        let err = RuleDocument::from_yaml(yaml).unwrap().specs().unwrap_err();
        assert!(format!("{:#}", err).contains("Rule #2"));
    }

    #[test]
    fn unknown_operation_is_rejected_at_parse_time() {
        let yaml = "rules:\n  - chain: FW_X\n    op: zap\n";
        assert!(RuleDocument::from_yaml(yaml).is_err());
    }
}
