// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::FirewallError;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    All,
    Any,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let x = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::All => "all",
            Protocol::Any => "any",
        };

        write!(f, "{}", x)
    }
}

impl FromStr for Protocol {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "all" => Ok(Protocol::All),
            "any" => Ok(Protocol::Any),
            x => Err(FirewallError::Parse(format!("unknown protocol {}", x))),
        }
    }
}

/// An accepted `(port, protocol)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FirewallRule {
    pub port: u16,
    pub protocol: Protocol,
}

impl FirewallRule {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Parses a port, rejecting 0.
pub(crate) fn parse_port(s: &str) -> Result<u16, FirewallError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(FirewallError::Parse(format!("invalid port {}", s))),
        Ok(x) => Ok(x),
    }
}
