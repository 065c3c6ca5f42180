// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

// Warnings are errors when building on CI.
#![cfg_attr(not(debug_assertions), deny(warnings))]

mod error;

pub(crate) use error::Result;
pub use error::{Error, ErrorKind, TimeoutPhase};

pub mod config;
pub mod query;
pub mod transport;

/// The version of the TimeVault Client Query Engine.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");
