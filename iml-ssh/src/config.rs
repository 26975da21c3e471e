// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! A small reader for OpenSSH client config files.
//!
//! Only `Host`, `HostName`, `User`, `Port` and `IdentityFile` are understood;
//! every other directive is ignored. As with `ssh`, the first value obtained
//! for a key wins, so specific `Host` blocks belong above `Host *`.

use crate::ImlSshError;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
struct Block {
    patterns: Vec<String>,
    config: HostConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

impl SshConfig {
    pub fn parse(s: &str) -> Result<Self, ImlSshError> {
        let mut blocks = vec![Block {
            patterns: vec!["*".into()],
            config: HostConfig::default(),
        }];

        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = split_directive(line).ok_or_else(|| ImlSshError::ConfigParse {
                line: idx + 1,
                reason: format!("expected `Key value`, got `{}`", line),
            })?;

            let key = key.to_ascii_lowercase();

            if key == "host" {
                blocks.push(Block {
                    patterns: value.split_whitespace().map(String::from).collect(),
                    config: HostConfig::default(),
                });

                continue;
            }

            let cfg = match blocks.last_mut() {
                Some(x) => &mut x.config,
                None => continue,
            };

            match key.as_str() {
                "hostname" => {
                    cfg.hostname.get_or_insert_with(|| value.to_string());
                }
                "user" => {
                    cfg.user.get_or_insert_with(|| value.to_string());
                }
                "port" => {
                    let port = value.parse().map_err(|_| ImlSshError::ConfigParse {
                        line: idx + 1,
                        reason: format!("invalid port `{}`", value),
                    })?;

                    cfg.port.get_or_insert(port);
                }
                "identityfile" => {
                    cfg.identity_file.get_or_insert_with(|| expand_tilde(value));
                }
                _ => {
                    tracing::trace!("Ignoring ssh config directive {}", key);
                }
            }
        }

        Ok(Self { blocks })
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ImlSshError> {
        let s = tokio::fs::read_to_string(path).await?;

        Self::parse(&s)
    }

    /// The merged settings for `host`.
    pub fn lookup(&self, host: &str) -> HostConfig {
        self.blocks
            .iter()
            .filter(|b| b.patterns.iter().any(|p| glob_match(p, host)))
            .fold(HostConfig::default(), |mut acc, b| {
                if acc.hostname.is_none() {
                    acc.hostname = b.config.hostname.clone();
                }
                if acc.user.is_none() {
                    acc.user = b.config.user.clone();
                }
                if acc.port.is_none() {
                    acc.port = b.config.port;
                }
                if acc.identity_file.is_none() {
                    acc.identity_file = b.config.identity_file.clone();
                }

                acc
            })
    }
}

fn split_directive(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;

    let (key, rest) = line.split_at(idx);

    let value = rest
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim()
        .trim_matches('"');

    if value.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

fn expand_tilde(x: &str) -> PathBuf {
    match (x.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(x),
    }
}

/// `*` and `?` wildcards, with a leading `!` negating the pattern.
fn glob_match(pattern: &str, s: &str) -> bool {
    if let Some(p) = pattern.strip_prefix('!') {
        return !glob_match(p, s);
    }

    fn go(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&p[1..], s) || (!s.is_empty() && go(p, &s[1..])),
            (Some(b'?'), Some(_)) => go(&p[1..], &s[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &s[1..]),
            _ => false,
        }
    }

    go(pattern.as_bytes(), s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
# vagrant cluster
Host node1 node1.local
    HostName 10.73.10.21
    User vagrant
    Port 2200
    IdentityFile /home/me/.vagrant/node1/private_key

Host node*
    User admin
    IdentityFile=/home/me/.ssh/cluster

Host *
    User root
    Port 22
"#;

    #[test]
    fn test_lookup_specific_block() {
        let cfg = SshConfig::parse(CONFIG).unwrap();

        assert_eq!(
            cfg.lookup("node1"),
            HostConfig {
                hostname: Some("10.73.10.21".into()),
                user: Some("vagrant".into()),
                port: Some(2200),
                identity_file: Some("/home/me/.vagrant/node1/private_key".into()),
            }
        );
    }

    #[test]
    fn test_lookup_wildcard_block() {
        let cfg = SshConfig::parse(CONFIG).unwrap();

        assert_eq!(
            cfg.lookup("node2"),
            HostConfig {
                hostname: None,
                user: Some("admin".into()),
                port: Some(22),
                identity_file: Some("/home/me/.ssh/cluster".into()),
            }
        );
    }

    #[test]
    fn test_lookup_fallback() {
        let cfg = SshConfig::parse(CONFIG).unwrap();

        let x = cfg.lookup("mds1.example.com");

        assert_eq!(x.user.as_deref(), Some("root"));
        assert_eq!(x.hostname, None);
    }

    #[test]
    fn test_bad_port() {
        let r = SshConfig::parse("Host x\n  Port abc\n");

        assert!(matches!(r, Err(ImlSshError::ConfigParse { line: 2, .. })));
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("node?", "node3"));
        assert!(glob_match("*.local", "a.local"));
        assert!(!glob_match("node?", "node10"));
        assert!(!glob_match("!node1", "node1"));
    }
}
