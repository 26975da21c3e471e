// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{
    rule::{parse_port, FirewallRule, Protocol},
    FirewallError,
};
use lazy_static::lazy_static;
use regex::Regex;

/// The firewall tooling found on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallBackend {
    /// EL6 style `iptables` managed through `lokkit`.
    IpTables,
    /// EL7 style `firewalld`.
    FirewallCmd,
}

impl FirewallBackend {
    pub const ALL: [FirewallBackend; 2] = [FirewallBackend::IpTables, FirewallBackend::FirewallCmd];

    /// Lower wins when more than one backend is installed.
    pub fn class_priority(self) -> u8 {
        match self {
            FirewallBackend::FirewallCmd => 1,
            FirewallBackend::IpTables => 2,
        }
    }

    /// Exits 0 when this backend is installed.
    pub fn detect_cmd(self) -> &'static str {
        match self {
            FirewallBackend::IpTables => "which lokkit",
            FirewallBackend::FirewallCmd => "which firewall-cmd",
        }
    }

    pub fn list_cmd(self) -> &'static str {
        match self {
            FirewallBackend::IpTables => "iptables -L INPUT -nv",
            FirewallBackend::FirewallCmd => "firewall-cmd --list-ports",
        }
    }

    /// Commands that open `port`. firewalld needs a runtime and a permanent change.
    pub fn add_port_cmds(self, port: u16, proto: Protocol) -> Vec<String> {
        match self {
            FirewallBackend::IpTables => {
                vec![format!("lokkit --port={}:{} --update", port, proto)]
            }
            FirewallBackend::FirewallCmd => vec![
                format!("firewall-cmd --add-port={}/{}", port, proto),
                format!("firewall-cmd --add-port={}/{} --permanent", port, proto),
            ],
        }
    }

    pub fn remove_port_cmds(self, port: u16, proto: Protocol) -> Vec<String> {
        match self {
            FirewallBackend::IpTables => vec![format!(
                "iptables -D INPUT -m state --state new -p {} --dport {} -j ACCEPT && iptables-save",
                proto, port
            )],
            FirewallBackend::FirewallCmd => vec![
                format!("firewall-cmd --remove-port={}/{}", port, proto),
                format!("firewall-cmd --remove-port={}/{} --permanent", port, proto),
            ],
        }
    }

    /// Exits 0 when `port` is open in the persistent configuration.
    pub fn validate_persistent_cmd(self, port: u16) -> String {
        match self {
            FirewallBackend::IpTables => format!(
                "grep -e '--dport {}' /etc/sysconfig/iptables && grep -e '--port={}:' /etc/sysconfig/system-config-firewall",
                port, port
            ),
            FirewallBackend::FirewallCmd => {
                format!("firewall-cmd --list-ports --permanent | grep {}", port)
            }
        }
    }

    /// Parses the output of [`list_cmd`](Self::list_cmd) into a fresh rule list.
    pub fn parse_rules(self, output: &str) -> Result<Vec<FirewallRule>, FirewallError> {
        match self {
            FirewallBackend::IpTables => parse_iptables(output),
            FirewallBackend::FirewallCmd => parse_firewall_cmd(output),
        }
    }
}

/// Reads the INPUT chain up to the first `REJECT` row.
///
/// Rules after a `REJECT` cannot be treated as effective without analysing
/// the chain, so they are not reported.
fn parse_iptables(output: &str) -> Result<Vec<FirewallRule>, FirewallError> {
    lazy_static! {
        static ref ROW: Regex = Regex::new(
            r"ACCEPT\s+(all|udp|tcp)\s+.*0\.0\.0\.0/0\s+0\.0\.0\.0/0\s+state NEW\s+(all|udp|tcp)\s+dpt:(\d+)"
        )
        .unwrap();
        static ref REJECT: Regex = Regex::new(r"^\s*\d+\S*\s+\d+\S*\s+REJECT\s").unwrap();
    }

    let mut lines = output
        .lines()
        .skip_while(|x| !x.starts_with("Chain INPUT (policy ACCEPT"));

    if lines.next().is_none() {
        return Err(FirewallError::Parse(
            "no `Chain INPUT (policy ACCEPT` line in iptables output".into(),
        ));
    }

    let mut rules = vec![];

    for line in lines {
        if line.trim().is_empty() || REJECT.is_match(line) {
            break;
        }

        if let Some(caps) = ROW.captures(line) {
            let protocol = caps[1].parse()?;
            let port = parse_port(&caps[3])?;

            rules.push(FirewallRule::new(port, protocol));
        }
    }

    Ok(rules)
}

fn parse_firewall_cmd(output: &str) -> Result<Vec<FirewallRule>, FirewallError> {
    let mut rules = vec![];

    for token in output.split_whitespace() {
        let (port, proto) = match token.find('/') {
            Some(idx) => (&token[..idx], &token[idx + 1..]),
            None => {
                return Err(FirewallError::Parse(format!(
                    "expected <port>/<proto>, got {}",
                    token
                )))
            }
        };

        if port.contains('-') {
            tracing::warn!("Ignoring firewall port range {}", token);

            continue;
        }

        rules.push(FirewallRule::new(parse_port(port)?, proto.parse()?));
    }

    Ok(rules)
}
