/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::OnceLock;

use tracing::Level;

/// A global runtime handle used for spawning write, heartbeat and nudger
/// tasks. Do not use for executing long running or compute intensive tasks.
static RUNTIME: OnceLock<tokio::runtime::Handle> = OnceLock::new();

/// Get a handle to the global runtime.
///
/// Panics if the runtime has not been initialized *and* the caller is not in an
/// async context.
pub(crate) fn get_runtime() -> tokio::runtime::Handle {
    match RUNTIME.get() {
        Some(handle) => handle.clone(),
        None => tokio::runtime::Handle::current(),
    }
}

/// Initialize the transport. Specifically:
/// - Store the provided tokio runtime handle, so that connections and
///   links may be driven from threads outside the runtime.
/// - Initialize logging defaults.
///
/// Subsequent calls keep the first handle.
pub fn initialize(handle: tokio::runtime::Handle) {
    if RUNTIME.set(handle).is_err() {
        tracing::debug!("runtime already initialized; keeping the first handle");
    }
    initialize_logging();
}

/// Initialize using the current tokio runtime handle.
pub fn initialize_with_current_runtime() {
    initialize(tokio::runtime::Handle::current());
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
pub fn initialize_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(Level::INFO.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Set up a tracing subscriber with a filter, so we can print tracing logs
/// with >= level from a test or tool.
///
/// This is better than the traced_test macro when logs_contain and logs_assert
/// are not needed, because that macro prints TRACE level logs, which is too
/// verbose.
pub fn set_tracing_env_filter(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level.as_str()))
        .try_init();
}
