//! Narrow interface to the coordination service.
//!
//! The session never speaks the wire protocol itself: a [`Connector`] opens a
//! [`SessionHandle`], requests are submitted tagged with an [`Xid`], and
//! replies, fired watches and connection-state changes come back as [`Event`]s
//! from [`SessionHandle::poll`].
use std::{fmt, time::Duration};

use crate::{
    error::{ZkError, ZkResult},
    models::{Acl, CreateMode, Stat, WatchedEvent},
};

/// Transaction id correlating a request with its reply.
pub type Xid = i64;

/// Parameters used to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// comma separated `host:port` list
    pub hosts: String,
    /// negotiated session timeout
    pub timeout: Duration,
}

/// A request against the coordination service. Paths are absolute server
/// paths (chroot already applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// create a node
    Create {
        /// node path (prefix, for sequential nodes)
        path: String,
        /// initial data
        data: Vec<u8>,
        /// initial ACL
        acl: Vec<Acl>,
        /// creation flags
        mode: CreateMode,
    },
    /// read node data, optionally arming a data watch
    Get {
        /// node path
        path: String,
        /// arm a data watch
        watch: bool,
    },
    /// write node data
    Set {
        /// node path
        path: String,
        /// new data
        data: Vec<u8>,
        /// expected version, `-1` for any
        version: i32,
    },
    /// delete a node
    Delete {
        /// node path
        path: String,
        /// expected version, `-1` for any
        version: i32,
    },
    /// stat a node, optionally arming an exists watch (armed even if the node
    /// is absent)
    Exists {
        /// node path
        path: String,
        /// arm an exists watch
        watch: bool,
    },
    /// list children, optionally arming a child watch
    GetChildren {
        /// node path
        path: String,
        /// arm a child watch
        watch: bool,
    },
    /// read a node ACL
    GetAcl {
        /// node path
        path: String,
    },
    /// apply credentials to the session
    AddAuth {
        /// auth scheme, usually `digest`
        scheme: String,
        /// scheme specific credential
        credential: String,
    },
}

impl Operation {
    /// short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Get { .. } => "get",
            Operation::Set { .. } => "set",
            Operation::Delete { .. } => "delete",
            Operation::Exists { .. } => "exists",
            Operation::GetChildren { .. } => "get_children",
            Operation::GetAcl { .. } => "get_acl",
            Operation::AddAuth { .. } => "add_auth",
        }
    }

    /// the node path the operation targets, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Create { path, .. }
            | Operation::Get { path, .. }
            | Operation::Set { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Exists { path, .. }
            | Operation::GetChildren { path, .. }
            | Operation::GetAcl { path } => Some(path),
            Operation::AddAuth { .. } => None,
        }
    }
}

/// Successful reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReply {
    /// path of the created node
    Created(String),
    /// node data and metadata
    Data(Vec<u8>, Stat),
    /// node metadata
    Stat(Stat),
    /// sorted child names and parent metadata
    Children(Vec<String>, Stat),
    /// node ACL and metadata
    Acl(Vec<Acl>, Stat),
    /// no payload
    Done,
}

/// Connection-level state change reported by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// the session is established (first connect or after a disconnect)
    Connected,
    /// transient network loss, the server may still hold the session
    Disconnected,
    /// the server expired the session; the handle is unusable
    Expired,
    /// credentials were rejected
    AuthFailed,
}

/// Something arriving from the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// completion of a submitted request
    Reply {
        /// id given at submit time
        xid: Xid,
        /// outcome
        result: ZkResult<OpReply>,
    },
    /// a watch fired (path is a server path)
    Watch(WatchedEvent),
    /// connection state change
    State(ConnectionEvent),
}

/// Opens sessions. DNS failure must be reported as [`ZkError::DnsFailure`],
/// any other inability to reach the service as [`ZkError::ConnectionLoss`].
pub trait Connector: fmt::Debug {
    /// open a new session
    fn connect(&self, params: &ConnectParams) -> ZkResult<Box<dyn SessionHandle>>;
}

/// One live session with the coordination service.
pub trait SessionHandle: fmt::Debug {
    /// server assigned session id
    fn session_id(&self) -> i64;

    /// queue a request; its outcome is delivered later as [`Event::Reply`]
    fn submit(&mut self, xid: Xid, op: Operation) -> ZkResult<()>;

    /// next pending event; waits up to `wait` when given and nothing is queued
    fn poll(&mut self, wait: Option<Duration>) -> Option<Event>;

    /// tear the session down
    fn close(&mut self);
}

impl From<ZkError> for Event {
    fn from(err: ZkError) -> Self {
        match err {
            ZkError::SessionExpired => Event::State(ConnectionEvent::Expired),
            ZkError::AuthFailed => Event::State(ConnectionEvent::AuthFailed),
            _ => Event::State(ConnectionEvent::Disconnected),
        }
    }
}
