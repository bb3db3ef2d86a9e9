/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

fn filter_layer() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Install a subscriber logging to `stdout` that respects `RUST_LOG`.
///
/// Without the environment variable, the "info" level is used.
pub fn init_subscriber() {
    tracing_subscriber::registry()
        .with(filter_layer())
        .with(fmt::layer().with_target(true))
        .init();
}

/// Install a subscriber for the current test thread only.
///
/// Output goes through the test harness capture. The subscriber is removed when the
/// returned guard drops.
pub fn init_test_subscriber() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::registry()
        .with(filter_layer())
        .with(fmt::layer().with_target(true).with_test_writer())
        .set_default()
}
