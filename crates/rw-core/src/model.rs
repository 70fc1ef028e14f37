use crate::error::RuleError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address family of a ruleset. IPv4 and IPv6 are dumped, merged and
/// committed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn number(self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Family::V4 => 0,
            Family::V6 => 1,
        }
    }

    /// Single-rule tool (`iptables` / `ip6tables`)
    pub fn iptables(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    /// State dump tool
    pub fn save_program(self) -> &'static str {
        match self {
            Family::V4 => "iptables-save",
            Family::V6 => "ip6tables-save",
        }
    }

    /// Atomic bulk-load tool
    pub fn restore_program(self) -> &'static str {
        match self {
            Family::V4 => "iptables-restore",
            Family::V6 => "ip6tables-restore",
        }
    }

    pub fn contains(self, net: &IpNet) -> bool {
        matches!(
            (self, net),
            (Family::V4, IpNet::V4(_)) | (Family::V6, IpNet::V6(_))
        )
    }
}

impl Default for Family {
    fn default() -> Self {
        Family::V4
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl TryFrom<u8> for Family {
    type Error = RuleError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(Family::V4),
            6 => Ok(Family::V6),
            other => Err(RuleError::UnknownFamily(other.to_string())),
        }
    }
}

impl From<Family> for u8 {
    fn from(family: Family) -> Self {
        family.number()
    }
}

impl FromStr for Family {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "4" | "v4" | "ipv4" => Ok(Family::V4),
            "6" | "v6" | "ipv6" => Ok(Family::V6),
            other => Err(RuleError::UnknownFamily(other.to_string())),
        }
    }
}

/// Packet-filter tables managed by the engine. Any other table found in a
/// dump is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    /// Serialization order of a bulk-load payload
    pub const ALL: [Table; 4] = [Table::Filter, Table::Nat, Table::Mangle, Table::Raw];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Table::Filter => 0,
            Table::Nat => 1,
            Table::Mangle => 2,
            Table::Raw => 3,
        }
    }

    pub fn parse(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::Filter
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::parse(s).ok_or_else(|| RuleError::UnknownTable(s.to_string()))
    }
}

/// What a queued rule asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operation {
    Append,
    Insert,
    Delete,
    NewChain,
    DestroyChain,
    FlushChain,
}

impl Operation {
    pub fn verb(self) -> &'static str {
        match self {
            Operation::Append => "-A",
            Operation::Insert => "-I",
            Operation::Delete => "-D",
            Operation::NewChain => "-N",
            Operation::DestroyChain => "-X",
            Operation::FlushChain => "-F",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Append => "append",
            Operation::Insert => "insert",
            Operation::Delete => "delete",
            Operation::NewChain => "new_chain",
            Operation::DestroyChain => "destroy_chain",
            Operation::FlushChain => "flush_chain",
        }
    }

    /// Chain lifecycle operations carry no match/jump part.
    pub fn is_chain_op(self) -> bool {
        matches!(
            self,
            Operation::NewChain | Operation::DestroyChain | Operation::FlushChain
        )
    }
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Append
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

impl FromStr for Operation {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim() {
            "-A" | "append" => Operation::Append,
            "-I" | "insert" => Operation::Insert,
            "-D" | "delete" => Operation::Delete,
            "-N" | "new_chain" => Operation::NewChain,
            "-X" | "destroy_chain" => Operation::DestroyChain,
            "-F" | "flush_chain" => Operation::FlushChain,
            other => return Err(RuleError::UnknownOperation(other.to_string())),
        };
        Ok(op)
    }
}

impl TryFrom<String> for Operation {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.name().to_string()
    }
}
