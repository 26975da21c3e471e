// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use lazy_static::lazy_static;
use std::{env, path::PathBuf};

lazy_static! {
    static ref QUICK_TEST_SETUP: bool = env::var_os("IML_QUICK_TEST_SETUP").is_some();
}

lazy_static! {
    static ref IML_4_INSTALLED: bool = env::var_os("IML_4_INSTALLED").is_some();
}

/// Which proxy variables should be stripped before talking to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreProxy {
    /// Strip every proxy variable.
    All,
    /// Strip only the named variables.
    List(Vec<String>),
}

/// The proxy variables `IgnoreProxy::All` refers to.
pub const PROXY_VARS: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "all_proxy",
    "ALL_PROXY",
];

fn empty_str_to_none(x: String) -> Option<String> {
    match x.trim() {
        "" => None,
        _ => Some(x),
    }
}

fn get_var_opt(name: &str) -> Option<String> {
    env::var(name).ok().and_then(empty_str_to_none)
}

/// Parse the value of `IGNORE_PROXY_LIST`.
///
/// `all` strips every proxy variable, otherwise the value is a whitespace
/// separated list of variable names.
pub fn parse_ignore_proxy_list(x: &str) -> Option<IgnoreProxy> {
    let x = x.trim();

    if x.is_empty() {
        return None;
    }

    if x.eq_ignore_ascii_case("all") {
        return Some(IgnoreProxy::All);
    }

    Some(IgnoreProxy::List(
        x.split_whitespace().map(String::from).collect(),
    ))
}

impl IgnoreProxy {
    /// The environment variable names that should be removed.
    pub fn vars(&self) -> Vec<String> {
        match self {
            IgnoreProxy::All => PROXY_VARS.iter().map(|x| x.to_string()).collect(),
            IgnoreProxy::List(xs) => xs.clone(),
        }
    }
}

/// Path to an optional ssh config file (`SSH_CONFIG`).
pub fn get_ssh_config() -> Option<PathBuf> {
    get_var_opt("SSH_CONFIG").map(PathBuf::from)
}

/// Value of `IGNORE_PROXY_LIST`, if any.
pub fn get_ignore_proxy_list() -> Option<IgnoreProxy> {
    get_var_opt("IGNORE_PROXY_LIST").and_then(|x| parse_ignore_proxy_list(&x))
}

/// `IML_QUICK_TEST_SETUP` set to anything skips the full reset.
pub fn quick_test_setup() -> bool {
    *QUICK_TEST_SETUP
}

/// `IML_4_INSTALLED` switches the CIB primitive schema expectation.
pub fn iml_4_installed() -> bool {
    *IML_4_INSTALLED
}

/// The version being upgraded from, when running upgrade tests.
pub fn get_upgrade_from_ver() -> Option<String> {
    get_var_opt("UPGRADE_FROM_VER")
}

/// Where the final cluster config should be written.
pub fn get_lustre_filesystem_configfile() -> Option<PathBuf> {
    get_var_opt("LUSTRE_FILESYSTEM_CONFIGFILE").map(PathBuf::from)
}

/// Returns the value of `no_proxy` / `NO_PROXY`, split on commas.
pub fn get_no_proxy() -> Vec<String> {
    get_var_opt("no_proxy")
        .or_else(|| get_var_opt("NO_PROXY"))
        .map(|x| {
            x.split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Returns the first proxy variable that is set, together with its value.
pub fn get_proxy_for_scheme(scheme: &str) -> Option<(String, String)> {
    let names = match scheme {
        "https" => ["https_proxy", "HTTPS_PROXY", "all_proxy", "ALL_PROXY"],
        _ => ["http_proxy", "HTTP_PROXY", "all_proxy", "ALL_PROXY"],
    };

    names
        .iter()
        .find_map(|x| get_var_opt(x).map(|v| (x.to_string(), v)))
}
