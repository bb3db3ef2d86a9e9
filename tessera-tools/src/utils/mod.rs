/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
pub mod bin_file;
pub use bin_file::*;

pub mod manifest;
pub use manifest::*;

pub mod tracing;
pub use tracing::{init_subscriber, init_test_subscriber};
