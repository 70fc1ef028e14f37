use crate::error::{Result, RuleError};
use crate::model::{Family, Operation, Table};
use crate::wire;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// A base match field that may be inverted with `!`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negatable<T> {
    pub value: T,
    pub negate: bool,
}

/// One `-m <module> [!] <options>` clause. Clause order is part of the
/// rule's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchClause {
    pub module: String,
    pub options: Vec<String>,
    pub negate: bool,
}

impl MatchClause {
    pub fn new(module: impl Into<String>, options: &str, negate: bool) -> Self {
        Self {
            module: module.into(),
            options: options.split_whitespace().map(str::to_string).collect(),
            negate,
        }
    }

    fn push_tokens(&self, tokens: &mut Vec<String>) {
        tokens.push("-m".to_string());
        tokens.push(self.module.clone());
        if self.negate {
            tokens.push("!".to_string());
        }
        tokens.extend(self.options.iter().cloned());
    }
}

/// Builder and value object for a single packet-filter rule intent.
///
/// Setters consume and return the spec so rules read as one chain of calls:
///
/// ```
/// use rw_core::{RuleSpec, Table};
///
/// let rule = RuleSpec::new(Table::Nat)
///     .chain("FW_PREROUTING")
///     .protocol("udp")
///     .dport("123")
///     .jump("FW_NTP_REDIRECT");
/// assert_eq!(
///     rule.essential(),
///     "FW_PREROUTING -p udp -m udp --dport 123 -j FW_NTP_REDIRECT"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpec {
    pub family: Family,
    pub table: Table,
    pub chain: Option<String>,
    pub operation: Operation,
    source: Option<Negatable<IpNet>>,
    destination: Option<Negatable<IpNet>>,
    in_interface: Option<Negatable<String>>,
    out_interface: Option<Negatable<String>>,
    protocol: Option<Negatable<String>>,
    matches: Vec<MatchClause>,
    target: Option<String>,
    defects: Vec<RuleError>,
}

impl RuleSpec {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    pub fn family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn table(mut self, table: Table) -> Self {
        self.table = table;
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn protocol(self, protocol: impl Into<String>) -> Self {
        self.set_protocol(protocol.into(), false)
    }

    pub fn not_protocol(self, protocol: impl Into<String>) -> Self {
        self.set_protocol(protocol.into(), true)
    }

    pub fn source(mut self, addr: &str) -> Self {
        self.source = self.parse_net(addr, false);
        self
    }

    pub fn not_source(mut self, addr: &str) -> Self {
        self.source = self.parse_net(addr, true);
        self
    }

    pub fn destination(mut self, addr: &str) -> Self {
        self.destination = self.parse_net(addr, false);
        self
    }

    pub fn not_destination(mut self, addr: &str) -> Self {
        self.destination = self.parse_net(addr, true);
        self
    }

    pub fn in_interface(mut self, iface: impl Into<String>) -> Self {
        self.in_interface = Some(Negatable {
            value: iface.into(),
            negate: false,
        });
        self
    }

    pub fn not_in_interface(mut self, iface: impl Into<String>) -> Self {
        self.in_interface = Some(Negatable {
            value: iface.into(),
            negate: true,
        });
        self
    }

    pub fn out_interface(mut self, iface: impl Into<String>) -> Self {
        self.out_interface = Some(Negatable {
            value: iface.into(),
            negate: false,
        });
        self
    }

    pub fn not_out_interface(mut self, iface: impl Into<String>) -> Self {
        self.out_interface = Some(Negatable {
            value: iface.into(),
            negate: true,
        });
        self
    }

    /// Arbitrary match module, e.g. `module("conntrack", "--ctdir ORIGINAL")`.
    pub fn module(mut self, module: impl Into<String>, options: &str) -> Self {
        self.matches.push(MatchClause::new(module, options, false));
        self
    }

    pub fn not_module(mut self, module: impl Into<String>, options: &str) -> Self {
        self.matches.push(MatchClause::new(module, options, true));
        self
    }

    /// `-m set [!] --match-set <name> <dirs>`
    pub fn match_set(mut self, name: &str, dirs: &str, negate: bool) -> Self {
        let options = format!("--match-set {} {}", name, dirs);
        self.matches.push(MatchClause::new("set", &options, negate));
        self
    }

    pub fn sport(self, port: &str) -> Self {
        self.port_match("--sport", port)
    }

    pub fn dport(self, port: &str) -> Self {
        self.port_match("--dport", port)
    }

    pub fn comment(mut self, text: &str) -> Self {
        self.matches.push(MatchClause {
            module: "comment".to_string(),
            options: vec!["--comment".to_string(), wire::quote(text)],
            negate: false,
        });
        self
    }

    /// Jump target with its arguments, e.g. `jump("MARK --set-xmark 0x0/0xffff")`.
    pub fn jump(mut self, target: &str) -> Self {
        self.target = Some(wire::join(target.split_whitespace()));
        self
    }

    /// `-j LOG --log-prefix <prefix>` with the prefix quoted as a dump would.
    pub fn log(mut self, prefix: &str) -> Self {
        self.target = Some(format!("LOG --log-prefix {}", wire::quote(prefix)));
        self
    }

    /// Copy of this rule carrying a different operation.
    pub fn with_operation(&self, operation: Operation) -> Self {
        self.clone().operation(operation)
    }

    /// Copy of this rule for another address family.
    pub fn with_family(&self, family: Family) -> Self {
        self.clone().family(family)
    }

    pub fn matches(&self) -> &[MatchClause] {
        &self.matches
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Reject intents that can never be applied.
    pub fn validate(&self) -> Result<()> {
        if let Some(defect) = self.defects.first() {
            return Err(defect.clone());
        }
        if self.chain.as_deref().is_none_or(str::is_empty) {
            return Err(RuleError::MissingChain {
                op: self.operation,
            });
        }
        for net in [&self.source, &self.destination].into_iter().flatten() {
            if !self.family.contains(&net.value) {
                return Err(RuleError::FamilyMismatch {
                    addr: net.value.to_string(),
                    family: self.family,
                });
            }
        }
        Ok(())
    }

    /// Canonical identity of the rule: chain, matches and target in the
    /// exact layout `iptables-save` prints after the `-A` verb.
    pub fn essential(&self) -> String {
        let mut tokens = vec![self.chain.clone().unwrap_or_default()];
        if self.operation.is_chain_op() {
            return wire::join(tokens);
        }

        push_base(&mut tokens, "-s", self.source.as_ref().map(net_token));
        push_base(&mut tokens, "-d", self.destination.as_ref().map(net_token));
        push_base(&mut tokens, "-i", self.in_interface.clone());
        push_base(&mut tokens, "-o", self.out_interface.clone());
        push_base(&mut tokens, "-p", self.protocol.clone());

        for clause in &self.matches {
            clause.push_tokens(&mut tokens);
        }

        if let Some(target) = &self.target {
            tokens.push("-j".to_string());
            tokens.push(target.clone());
        }

        wire::join(tokens)
    }

    /// Shell script applying this rule on its own, guarded by an existence
    /// check so it can be replayed any number of times.
    pub fn command(&self, op: Operation) -> String {
        let base = format!("{} -w -t {}", self.family.iptables(), self.table);
        let chain = self.chain.as_deref().unwrap_or_default();
        let exists = format!("{} -n -L {} &>/dev/null", base, chain);

        match op {
            Operation::Append | Operation::Insert => {
                let essential = self.essential();
                format!(
                    "{base} -C {essential} &>/dev/null || {base} {verb} {essential}",
                    verb = op.verb()
                )
            }
            Operation::Delete => {
                let essential = self.essential();
                format!("{base} -C {essential} &>/dev/null && {base} -D {essential}; true")
            }
            Operation::NewChain => format!("{exists} || {base} -N {chain}"),
            Operation::FlushChain => format!("{exists} && {base} -F {chain}; true"),
            Operation::DestroyChain => {
                format!("{exists} && {{ {base} -F {chain}; {base} -X {chain}; }}; true")
            }
        }
    }

    fn set_protocol(mut self, protocol: String, negate: bool) -> Self {
        self.protocol = Some(Negatable {
            value: protocol.to_ascii_lowercase(),
            negate,
        });
        self
    }

    fn parse_net(&mut self, addr: &str, negate: bool) -> Option<Negatable<IpNet>> {
        let parsed = addr
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .or_else(|_| addr.parse::<IpAddr>().map(IpNet::from));
        match parsed {
            Ok(value) => Some(Negatable { value, negate }),
            Err(_) => {
                self.defects
                    .push(RuleError::InvalidAddress(addr.to_string()));
                None
            }
        }
    }

    // iptables-save folds every port option of a protocol into one clause
    // named after the protocol, with --sport ahead of --dport.
    fn port_match(mut self, option: &'static str, port: &str) -> Self {
        let Some(proto) = self.protocol.as_ref().map(|p| p.value.clone()) else {
            self.defects.push(RuleError::MissingProtocol { option });
            return self;
        };

        let existing = self
            .matches
            .iter_mut()
            .find(|clause| clause.module == proto && !clause.negate);
        match existing {
            Some(clause) if option == "--sport" => {
                clause.options.insert(0, port.to_string());
                clause.options.insert(0, option.to_string());
            }
            Some(clause) => {
                clause.options.extend([option.to_string(), port.to_string()]);
            }
            None => {
                self.matches.push(MatchClause {
                    module: proto,
                    options: vec![option.to_string(), port.to_string()],
                    negate: false,
                });
            }
        }
        self
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} {} {}",
            self.family,
            self.table,
            wire::rule_line(self.operation, &self.essential())
        )
    }
}

fn net_token(net: &Negatable<IpNet>) -> Negatable<String> {
    Negatable {
        value: net.value.to_string(),
        negate: net.negate,
    }
}

fn push_base(tokens: &mut Vec<String>, flag: &str, field: Option<Negatable<String>>) {
    if let Some(field) = field {
        if field.negate {
            tokens.push("!".to_string());
        }
        tokens.push(flag.to_string());
        tokens.push(field.value);
    }
}
