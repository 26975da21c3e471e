// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use iml_test_env::{get_ignore_proxy_list, get_no_proxy, get_proxy_for_scheme};
use std::env;
use url::Url;

/// Removes the proxy variables named by `IGNORE_PROXY_LIST` from this process.
pub fn strip_ignored_proxies() -> Vec<String> {
    let xs = get_ignore_proxy_list()
        .map(|x| x.vars())
        .unwrap_or_default();

    for x in &xs {
        if env::var_os(x).is_some() {
            tracing::info!("Removing {} from the environment", x);

            env::remove_var(x);
        }
    }

    xs
}

/// Whether `host` matches an entry of a `no_proxy` list.
pub fn bypasses_proxy(host: &str, no_proxy: &[String]) -> bool {
    no_proxy.iter().any(|x| {
        let x = x.trim_start_matches('.');

        x == "*" || host == x || host.ends_with(&format!(".{}", x))
    })
}

/// Warns when a proxy would be used to reach `url`.
///
/// Returns the proxy variable that would apply.
pub fn warn_if_proxied(url: &Url) -> Option<String> {
    let host = url.host_str()?;

    if bypasses_proxy(host, &get_no_proxy()) {
        return None;
    }

    let (name, value) = get_proxy_for_scheme(url.scheme())?;

    tracing::warn!(
        "{} is set to {}, requests to the manager at {} will be proxied. Add {} to no_proxy or set IGNORE_PROXY_LIST",
        name,
        value,
        host,
        host
    );

    Some(name)
}
