// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use std::{fs::OpenOptions, io, path::Path, sync::Mutex};
use tokio::signal::unix::{signal, SignalKind};
pub use tracing;
use tracing_subscriber::{
    fmt::{writer::MakeWriterExt as _, Subscriber},
    reload::Handle,
    EnvFilter,
};

/// Initialize logging by reading the `RUST_LOG` environment variable.
/// In addition, setup signal handlers
///
/// - `SIGUSR1` will set log level to info.
/// - `SIGUSR2` will set log level to debug.
///
/// Calling this more than once is a no-op.
pub fn init() {
    let builder = Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_filter_reloading();

    let handle = builder.reload_handle();

    if builder.try_init().is_ok() {
        spawn_reload_listeners(handle);
    }
}

/// Like `init`, but every event is also appended to the file at `path`.
///
/// The harness keeps one such file (`test.log`) per process so a run can be
/// post-mortemed from logs alone.
pub fn init_with_log_file(path: impl AsRef<Path>) -> Result<(), io::Error> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;

    let builder = Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(io::stderr.and(Mutex::new(file)))
        .with_filter_reloading();

    let handle = builder.reload_handle();

    if builder.try_init().is_ok() {
        spawn_reload_listeners(handle);
    }

    Ok(())
}

fn spawn_reload_listeners<L, S>(handle: Handle<L, S>)
where
    L: From<EnvFilter> + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return;
    }

    let handle2 = handle.clone();

    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::user_defined1()) {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!("Could not listen to SIGUSR1: {}", e);
                return;
            }
        };

        while stream.recv().await.is_some() {
            let _ = handle2.reload(EnvFilter::new("info"));
        }
    });

    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::user_defined2()) {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!("Could not listen to SIGUSR2: {}", e);
                return;
            }
        };

        while stream.recv().await.is_some() {
            let _ = handle.reload(EnvFilter::new("debug"));
        }
    });
}
