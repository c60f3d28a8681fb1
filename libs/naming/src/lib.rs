//! # naming
//!
//! Resolves logical service names to the current set of instance URLs and
//! reports when that set changes.
//!
//! Resolvers are picked by [`NamingType`]. A [`NamingRegistry`] holds one
//! factory per type and lazily builds, then caches, one resolver per type.
//! Resolvers own no retry policy: the coordination-backed one leans on
//! [`coordination::CoordinationSession`] for reconnects and recovery.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt, str::FromStr};

use coordination::SessionConfig;
use serde::{Deserialize, Serialize};

pub mod coordinated;
pub mod error;
pub mod registry;
pub mod static_table;

pub use coordinated::{CoordinationNaming, CoordinationNamingFactory};
pub use error::{NamingError, NamingResult};
pub use registry::NamingRegistry;
pub use static_table::{StaticNaming, StaticNamingFactory};

/// Default root under which service names live in the coordination service
pub const DEFAULT_NAMING_ROOT: &str = "/lodestar/services";

/// The closed set of naming back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingType {
    /// registry kept in the coordination service
    Coordination,
    /// static, locally configured table
    Static,
}

impl NamingType {
    /// lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            NamingType::Coordination => "coordination",
            NamingType::Static => "static",
        }
    }
}

impl fmt::Display for NamingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamingType {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordination" | "zk" | "zookeeper" => Ok(NamingType::Coordination),
            "static" | "local" => Ok(NamingType::Static),
            other => Err(NamingError::UnknownType(other.to_owned())),
        }
    }
}

/// The address set of a name changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameChange {
    /// service name
    pub name: String,
    /// the new sorted, duplicate-free URL set
    pub urls: Vec<String>,
}

/// Everything a factory may need to build a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConfig {
    /// coordination session parameters
    pub session: SessionConfig,
    /// node under which names live, e.g. `/lodestar/services`
    pub root: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            root: DEFAULT_NAMING_ROOT.to_owned(),
        }
    }
}

/// A name resolver.
///
/// All methods except [`resolve_blocking`], [`register`] and [`unregister`]
/// are non-blocking and meant to be called from the driver loop.
///
/// [`resolve_blocking`]: Naming::resolve_blocking
/// [`register`]: Naming::register
/// [`unregister`]: Naming::unregister
pub trait Naming: fmt::Debug {
    /// back-end type
    fn naming_type(&self) -> NamingType;

    /// Start tracking `name`; its address set is reported through
    /// [`take_changes`](Naming::take_changes) whenever it changes.
    fn watch_name(&mut self, name: &str) -> NamingResult<()>;

    /// Stop tracking `name`.
    fn unwatch_name(&mut self, name: &str) -> NamingResult<()>;

    /// Last resolved URL set of a tracked name.
    fn get_urls(&self, name: &str) -> Option<&[String]>;

    /// Look a name up synchronously. Bootstrap only: this blocks the caller.
    fn resolve_blocking(&mut self, name: &str) -> NamingResult<Vec<String>>;

    /// Publish `url` as `instance` of `name`. The registration lives as long
    /// as the resolver (for the coordination back-end, as an ephemeral node
    /// that is recreated after session expiry). Blocking.
    fn register(&mut self, name: &str, url: &str, instance: &str) -> NamingResult<()>;

    /// Withdraw a registration made with [`register`](Naming::register).
    /// Blocking.
    fn unregister(&mut self, name: &str, instance: &str) -> NamingResult<()>;

    /// Process back-end events; returns how many were handled.
    fn update(&mut self) -> usize;

    /// Drain pending address-set changes.
    fn take_changes(&mut self) -> Vec<NameChange>;
}

/// Builds resolvers of one type.
pub trait NamingFactory: fmt::Debug {
    /// Make a new resolver.
    fn create(&self, config: &NamingConfig) -> NamingResult<Box<dyn Naming>>;
}

/// Service names are non-empty, `/` separated, with no empty, `.` or `..`
/// segments and no leading or trailing `/`.
pub fn validate_name(name: &str) -> NamingResult<()> {
    let valid = !name.is_empty()
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(())
    } else {
        Err(NamingError::InvalidName(name.to_owned()))
    }
}

/// Sort and dedup a URL set.
pub fn normalize_urls(mut urls: Vec<String>) -> Vec<String> {
    urls.sort_unstable();
    urls.dedup();
    urls
}
