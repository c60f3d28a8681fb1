//! # lodestar
//!
//! Client-side runtime core: one non-blocking [`Driver::update`] tick pumps
//! transport I/O, dispatches inbound messages to processors, folds name
//! resolution changes into routing and dispatch, runs cooperative tasks and
//! fires timers.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use bytes;
pub use coordination;
pub use futures;
pub use naming;
pub use tokio;
pub use tracing;

pub use crate::driver::{Driver, DriverConfig, DriverHandle};

pub mod config;
pub mod driver;
pub mod env;
pub mod metrics;
pub mod prelude;
pub mod processor;
pub mod transport;
