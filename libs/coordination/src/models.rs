//! Node, ACL and watch models shared by the session and its backends.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Permissions and ACLs
// ---------------------------------------------------------------------------

/// Permission bits carried by an [`Acl`] entry.
pub mod perms {
    /// read data / list children
    pub const READ: u32 = 1 << 0;
    /// set data
    pub const WRITE: u32 = 1 << 1;
    /// create children
    pub const CREATE: u32 = 1 << 2;
    /// delete children
    pub const DELETE: u32 = 1 << 3;
    /// set ACL
    pub const ADMIN: u32 = 1 << 4;
    /// every permission
    pub const ALL: u32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// scheme granting access to everyone
pub const WORLD_SCHEME: &str = "world";
/// the only id of [`WORLD_SCHEME`]
pub const ANYONE_ID: &str = "anyone";
/// scheme expanded at create time to the creator's authenticated ids
pub const AUTH_SCHEME: &str = "auth";
/// `user:base64(sha1(user:password))` ids
pub const DIGEST_SCHEME: &str = "digest";

/// One access-control entry on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Acl {
    /// bitmask of [`perms`]
    pub perms: u32,
    /// authentication scheme the id belongs to
    pub scheme: String,
    /// identity within the scheme
    pub id: String,
}

impl Acl {
    /// Make a new ACL entry
    pub fn new(perms: u32, scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            perms,
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// Completely open ACL.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::new(perms::ALL, WORLD_SCHEME, ANYONE_ID)]
    }

    /// Read-only ACL for everyone.
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::new(perms::READ, WORLD_SCHEME, ANYONE_ID)]
    }

    /// Everything for the creator's authenticated identities.
    pub fn creator_all() -> Vec<Acl> {
        vec![Acl::new(perms::ALL, AUTH_SCHEME, "")]
    }

    /// ACL entry for a digest identity, `id` being `user:base64(sha1(user:pwd))`.
    pub fn digest(perms: u32, id: impl Into<String>) -> Self {
        Acl::new(perms, DIGEST_SCHEME, id)
    }

    /// Returns true if this entry grants `perm`.
    pub fn allows(&self, perm: u32) -> bool {
        self.perms & perm == perm
    }
}

// ---------------------------------------------------------------------------
// Node metadata
// ---------------------------------------------------------------------------

/// Node metadata returned with most read/write operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// zxid of the change that created the node
    pub czxid: i64,
    /// zxid of the last modification
    pub mzxid: i64,
    /// creation time, ms since epoch
    pub ctime: i64,
    /// last modification time, ms since epoch
    pub mtime: i64,
    /// data version
    pub version: i32,
    /// children version
    pub cversion: i32,
    /// ACL version
    pub aversion: i32,
    /// owning session id for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: i64,
    /// length of the data field
    pub data_length: i32,
    /// number of children
    pub num_children: i32,
    /// zxid of the last child change
    pub pzxid: i64,
}

impl Stat {
    /// Returns true if the node is owned by a session.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// Node creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// survives the creating session
    Persistent,
    /// deleted by the server when the creating session ends
    Ephemeral,
    /// persistent, with a monotonically increasing suffix
    PersistentSequential,
    /// ephemeral, with a monotonically increasing suffix
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true if the node is bound to the creating session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Returns true if the server appends a sequence suffix to the path.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

// ---------------------------------------------------------------------------
// Watches
// ---------------------------------------------------------------------------

/// The operation a watch was armed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    /// armed by `get`: fires on data change or delete
    Data,
    /// armed by `get_children`: fires on child create/delete or node delete
    Child,
    /// armed by `exists`: fires on create, data change or delete
    Exists,
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKind::Data => write!(f, "data"),
            WatchKind::Child => write!(f, "child"),
            WatchKind::Exists => write!(f, "exists"),
        }
    }
}

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// node created
    Created,
    /// node deleted
    Deleted,
    /// node data changed
    Changed,
    /// node children changed
    Child,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedEvent {
    /// kind of change
    pub event_type: EventType,
    /// path of the watched node, relative to the session chroot
    pub path: String,
}

impl WatchedEvent {
    /// Make a new event
    pub fn new(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }
}

/// Ephemeral node created through a session, kept so it can be recreated
/// after the session is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralNode {
    /// full (sequence-resolved) path
    pub path: String,
    /// data written at creation
    pub value: Vec<u8>,
    /// ACL written at creation
    pub acl: Vec<Acl>,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Validate an absolute node path: leading `/`, no trailing `/` (except the
/// root), no empty, `.` or `..` components.
pub fn validate_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..]
        .split('/')
        .all(|c| !c.is_empty() && c != "." && c != ".." && !c.contains('\0'))
}

/// Parent of an absolute node path, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
