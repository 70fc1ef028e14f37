//! The iptables-save / iptables-restore text format.
//!
//! Both the rule builder and the dump parser go through this module, so a
//! rule rendered by [`crate::RuleSpec::essential`] and the same rule read
//! back from `iptables-save` compare equal as plain strings.

use crate::model::{Operation, Table};

pub const COMMIT: &str = "COMMIT";

/// Quote a string argument the way xtables prints it in a save dump.
///
/// Values made only of `[A-Za-z0-9_-]` are printed bare; anything else is
/// wrapped in double quotes with `"`, `\` and `'` backslash-escaped.
pub fn quote(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if bare {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '\'') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Join non-empty tokens with single spaces.
pub fn join<I, S>(tokens: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for token in tokens {
        let token = token.as_ref();
        if token.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

pub fn table_header(table: Table) -> String {
    format!("*{}", table)
}

/// Declaration of a chain with zeroed counters, as emitted for chains that
/// were just created.
pub fn chain_declaration(chain: &str) -> String {
    format!(":{} - [0:0]", chain)
}

pub fn rule_line(op: Operation, essential: &str) -> String {
    format!("{} {}", op.verb(), essential)
}

/// Prefix shared by every essential form of a rule in `chain`.
pub fn chain_prefix(chain: &str) -> String {
    format!("{} ", chain)
}

/// One classified line of a dump or restore payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    TableHeader(&'a str),
    Commit,
    ChainDeclaration { name: &'a str, line: &'a str },
    NewChain(&'a str),
    DestroyChain(&'a str),
    Append(&'a str),
    Insert(&'a str),
    Other(&'a str),
}

/// Classify one line. Blank lines and `#` comments yield `None`.
pub fn classify(raw: &str) -> Option<Line<'_>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(table) = line.strip_prefix('*') {
        return Some(Line::TableHeader(table.trim()));
    }
    if line == COMMIT {
        return Some(Line::Commit);
    }
    if let Some(rest) = line.strip_prefix(':') {
        let name = rest.split_whitespace().next().unwrap_or(rest);
        return Some(Line::ChainDeclaration { name, line });
    }

    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => return Some(Line::Other(line)),
    };
    let classified = match verb {
        "-A" => Line::Append(rest),
        "-I" => Line::Insert(rest),
        "-N" => Line::NewChain(rest),
        "-X" => Line::DestroyChain(rest),
        _ => Line::Other(line),
    };
    Some(classified)
}
