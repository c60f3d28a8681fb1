//! # coordination
//!
//! Client-side session for a hierarchical coordination service (nodes,
//! ACLs, digest auth, one-shot watches, ephemeral nodes).
//!
//! This library provides:
//! - **Error codes** with the service's stable numeric values and
//!   classification helpers.
//! - **Backend traits** ([`Connector`], [`SessionHandle`]) so the session never
//!   depends on a wire protocol.
//! - **[`CoordinationSession`]**, which records watches, ephemeral nodes and
//!   credentials and replays them after reconnect or session expiry.
//! - **[`MemoryEnsemble`]**, an in-process service with injectable expiry,
//!   disconnects and DNS failure.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod backend;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod session;

pub use auth::{digest_encrypt, digest_id};
pub use backend::{
    ConnectParams, ConnectionEvent, Connector, Event, OpReply, Operation, SessionHandle, Xid,
};
pub use error::{ZkError, ZkResult};
pub use memory::{MemoryEnsemble, MemoryHandle, NodeSnapshot};
pub use models::{Acl, CreateMode, EphemeralNode, EventType, Stat, WatchKind, WatchedEvent};
pub use session::{CoordinationSession, Pending, SessionConfig, SessionState};
