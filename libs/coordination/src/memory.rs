//! In-process coordination service.
//!
//! [`MemoryEnsemble`] keeps a node tree, per-session auth and one-shot
//! watches behind a single lock, and hands out [`MemoryHandle`]s through the
//! [`Connector`] trait. It also exposes the knobs tests and the sandbox binary
//! need: expiring or suspending a session, failing DNS, refusing connections,
//! and direct node access that bypasses ACLs.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use crate::{
    auth,
    backend::{
        ConnectParams, ConnectionEvent, Connector, Event, OpReply, Operation, SessionHandle, Xid,
    },
    error::{ZkError, ZkResult},
    models::{
        ANYONE_ID, AUTH_SCHEME, Acl, CreateMode, DIGEST_SCHEME, EventType, Stat, WORLD_SCHEME,
        WatchKind, WatchedEvent, join_path, parent_path, perms, validate_path,
    },
};

/// session id used for administrative changes; never subject to ACLs
const ADMIN_SESSION: i64 = 0;

/// A node as stored by the ensemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// node data
    pub data: Vec<u8>,
    /// node ACL
    pub acl: Vec<Acl>,
    /// node metadata
    pub stat: Stat,
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
    next_seq: i32,
}

#[derive(Debug, Default)]
struct SessionSlot {
    /// `(scheme, id)` pairs the session authenticated as
    auths: Vec<(String, String)>,
    /// every credential applied, in order
    credentials: Vec<String>,
    data_watches: BTreeSet<String>,
    child_watches: BTreeSet<String>,
    exists_watches: BTreeSet<String>,
    outbox: VecDeque<Event>,
    alive: bool,
    connected: bool,
}

impl SessionSlot {
    fn watches(&self, kind: WatchKind) -> &BTreeSet<String> {
        match kind {
            WatchKind::Data => &self.data_watches,
            WatchKind::Child => &self.child_watches,
            WatchKind::Exists => &self.exists_watches,
        }
    }

    fn watches_mut(&mut self, kind: WatchKind) -> &mut BTreeSet<String> {
        match kind {
            WatchKind::Data => &mut self.data_watches,
            WatchKind::Child => &mut self.child_watches,
            WatchKind::Exists => &mut self.exists_watches,
        }
    }

    fn clear_watches(&mut self) {
        self.data_watches.clear();
        self.child_watches.clear();
        self.exists_watches.clear();
    }
}

#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<i64, SessionSlot>,
    next_session: i64,
    zxid: i64,
    dns_failure: bool,
    refuse_connections: bool,
}

impl Default for EnsembleState {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_owned(),
            Node {
                data: Vec::new(),
                acl: Acl::open_unsafe(),
                stat: Stat::default(),
                next_seq: 0,
            },
        );
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 0x1000,
            zxid: 0,
            dns_failure: false,
            refuse_connections: false,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<EnsembleState>,
    cond: Condvar,
}

/// In-memory coordination service; cheap to clone, all clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryEnsemble {
    inner: Arc<Shared>,
}

/// One session opened against a [`MemoryEnsemble`].
#[derive(Debug)]
pub struct MemoryHandle {
    inner: Arc<Shared>,
    session_id: i64,
    closed: bool,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl EnsembleState {
    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn check_perm(&self, session: i64, acl: &[Acl], perm: u32) -> ZkResult<()> {
        if session == ADMIN_SESSION {
            return Ok(());
        }
        let auths = self
            .sessions
            .get(&session)
            .map(|s| s.auths.as_slice())
            .unwrap_or_default();
        let granted = acl.iter().any(|entry| {
            entry.allows(perm)
                && ((entry.scheme == WORLD_SCHEME && entry.id == ANYONE_ID)
                    || auths
                        .iter()
                        .any(|(scheme, id)| *scheme == entry.scheme && *id == entry.id))
        });
        if granted { Ok(()) } else { Err(ZkError::NoAuth) }
    }

    /// Expand `auth` entries to the creator's authenticated ids.
    fn expand_acl(&self, session: i64, acl: &[Acl]) -> ZkResult<Vec<Acl>> {
        if acl.is_empty() {
            return Err(ZkError::InvalidAcl);
        }
        let auths = self
            .sessions
            .get(&session)
            .map(|s| s.auths.clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(acl.len());
        for entry in acl {
            if entry.scheme == AUTH_SCHEME {
                if auths.is_empty() {
                    return Err(ZkError::InvalidAcl);
                }
                out.extend(
                    auths
                        .iter()
                        .map(|(scheme, id)| Acl::new(entry.perms, scheme.clone(), id.clone())),
                );
            } else if entry.scheme == WORLD_SCHEME || entry.scheme == DIGEST_SCHEME {
                out.push(entry.clone());
            } else {
                return Err(ZkError::InvalidAcl);
            }
        }
        out.dedup();
        Ok(out)
    }

    /// Fire and remove matching one-shot watches. Each session gets at most
    /// one event per `(kind set, path)` batch.
    fn fire(&mut self, path: &str, event_type: EventType, kinds: &[WatchKind]) {
        for (id, slot) in self.sessions.iter_mut() {
            if !slot.alive {
                continue;
            }
            let mut hit = false;
            for kind in kinds {
                hit |= slot.watches_mut(*kind).remove(path);
            }
            if hit {
                trace!(session = id, path, ?event_type, "watch fired");
                slot.outbox
                    .push_back(Event::Watch(WatchedEvent::new(event_type, path)));
            }
        }
    }

    fn arm(&mut self, session: i64, kind: WatchKind, path: &str) {
        if let Some(slot) = self.sessions.get_mut(&session) {
            slot.watches_mut(kind).insert(path.to_owned());
        }
    }

    fn create(
        &mut self,
        session: i64,
        path: &str,
        data: Vec<u8>,
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String> {
        if !validate_path(path) || path == "/" {
            return Err(ZkError::BadArguments);
        }
        let parent = parent_path(path).ok_or(ZkError::BadArguments)?.to_owned();
        let acl = self.expand_acl(session, acl)?;
        let parent_node = self.nodes.get(&parent).ok_or(ZkError::NoNode)?;
        if parent_node.stat.is_ephemeral() {
            return Err(ZkError::NoChildrenForEphemerals);
        }
        self.check_perm(session, &parent_node.acl, perms::CREATE)?;

        let seq = parent_node.next_seq;
        let path = if mode.is_sequential() {
            format!("{path}{seq:010}")
        } else {
            path.to_owned()
        };
        if self.nodes.contains_key(&path) {
            return Err(ZkError::NodeExists);
        }

        let zxid = self.next_zxid();
        let now = now_ms();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: now,
            mtime: now,
            ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
            data_length: data.len() as i32,
            pzxid: zxid,
            ..Stat::default()
        };
        self.nodes.insert(
            path.clone(),
            Node {
                data,
                acl,
                stat,
                next_seq: 0,
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.next_seq += 1;
            parent_node.stat.num_children += 1;
            parent_node.stat.cversion += 1;
            parent_node.stat.pzxid = zxid;
        }
        self.fire(&path, EventType::Created, &[WatchKind::Exists]);
        self.fire(&parent, EventType::Child, &[WatchKind::Child]);
        Ok(path)
    }

    fn get(&mut self, session: i64, path: &str, watch: bool) -> ZkResult<(Vec<u8>, Stat)> {
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        self.check_perm(session, &node.acl, perms::READ)?;
        let out = (node.data.clone(), node.stat);
        if watch {
            self.arm(session, WatchKind::Data, path);
        }
        Ok(out)
    }

    fn set(&mut self, session: i64, path: &str, data: Vec<u8>, version: i32) -> ZkResult<Stat> {
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        self.check_perm(session, &node.acl, perms::WRITE)?;
        if version != -1 && version != node.stat.version {
            return Err(ZkError::BadVersion);
        }
        let zxid = self.next_zxid();
        let stat = match self.nodes.get_mut(path) {
            Some(node) => {
                node.stat.data_length = data.len() as i32;
                node.data = data;
                node.stat.version += 1;
                node.stat.mzxid = zxid;
                node.stat.mtime = now_ms();
                node.stat
            }
            None => return Err(ZkError::NoNode),
        };
        self.fire(path, EventType::Changed, &[WatchKind::Data, WatchKind::Exists]);
        Ok(stat)
    }

    fn delete(&mut self, session: i64, path: &str, version: i32) -> ZkResult<()> {
        if path == "/" {
            return Err(ZkError::BadArguments);
        }
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        if version != -1 && version != node.stat.version {
            return Err(ZkError::BadVersion);
        }
        if node.stat.num_children > 0 {
            return Err(ZkError::NotEmpty);
        }
        let parent = parent_path(path).ok_or(ZkError::BadArguments)?.to_owned();
        if let Some(parent_node) = self.nodes.get(&parent) {
            self.check_perm(session, &parent_node.acl, perms::DELETE)?;
        }
        self.remove_node(path, &parent);
        Ok(())
    }

    fn remove_node(&mut self, path: &str, parent: &str) {
        self.nodes.remove(path);
        let zxid = self.next_zxid();
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.stat.num_children -= 1;
            parent_node.stat.cversion += 1;
            parent_node.stat.pzxid = zxid;
        }
        self.fire(
            path,
            EventType::Deleted,
            &[WatchKind::Data, WatchKind::Exists, WatchKind::Child],
        );
        self.fire(parent, EventType::Child, &[WatchKind::Child]);
    }

    fn exists(&mut self, session: i64, path: &str, watch: bool) -> ZkResult<Stat> {
        if watch {
            self.arm(session, WatchKind::Exists, path);
        }
        self.nodes.get(path).map(|n| n.stat).ok_or(ZkError::NoNode)
    }

    fn get_children(
        &mut self,
        session: i64,
        path: &str,
        watch: bool,
    ) -> ZkResult<(Vec<String>, Stat)> {
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        self.check_perm(session, &node.acl, perms::READ)?;
        let stat = node.stat;
        let children = self.children_of(path);
        if watch {
            self.arm(session, WatchKind::Child, path);
        }
        Ok((children, stat))
    }

    fn add_auth(&mut self, session: i64, scheme: &str, credential: &str) -> ZkResult<()> {
        if scheme != DIGEST_SCHEME {
            return Err(ZkError::AuthFailed);
        }
        let id = auth::digest_id(credential).map_err(|_| ZkError::AuthFailed)?;
        let slot = self.sessions.get_mut(&session).ok_or(ZkError::SessionExpired)?;
        slot.credentials.push(credential.to_owned());
        let entry = (scheme.to_owned(), id);
        if !slot.auths.contains(&entry) {
            slot.auths.push(entry);
        }
        Ok(())
    }

    fn apply(&mut self, session: i64, op: Operation) -> ZkResult<OpReply> {
        match op {
            Operation::Create {
                path,
                data,
                acl,
                mode,
            } => self
                .create(session, &path, data, &acl, mode)
                .map(OpReply::Created),
            Operation::Get { path, watch } => self
                .get(session, &path, watch)
                .map(|(data, stat)| OpReply::Data(data, stat)),
            Operation::Set {
                path,
                data,
                version,
            } => self.set(session, &path, data, version).map(OpReply::Stat),
            Operation::Delete { path, version } => {
                self.delete(session, &path, version).map(|_| OpReply::Done)
            }
            Operation::Exists { path, watch } => {
                self.exists(session, &path, watch).map(OpReply::Stat)
            }
            Operation::GetChildren { path, watch } => self
                .get_children(session, &path, watch)
                .map(|(children, stat)| OpReply::Children(children, stat)),
            Operation::GetAcl { path } => self
                .nodes
                .get(&path)
                .map(|n| OpReply::Acl(n.acl.clone(), n.stat))
                .ok_or(ZkError::NoNode),
            Operation::AddAuth { scheme, credential } => self
                .add_auth(session, &scheme, &credential)
                .map(|_| OpReply::Done),
        }
    }

    /// Delete every ephemeral node owned by `session`, firing watches.
    fn drop_ephemerals(&mut self, session: i64) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session)
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned.iter().rev() {
            if let Some(parent) = parent_path(path).map(str::to_owned) {
                self.remove_node(path, &parent);
            }
        }
        owned.len()
    }
}

impl MemoryEnsemble {
    /// Make an empty ensemble containing only `/`.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut EnsembleState) -> T) -> T {
        let out = f(&mut self.inner.state.lock());
        self.inner.cond.notify_all();
        out
    }

    /// When set, `connect` fails with [`ZkError::DnsFailure`].
    pub fn set_dns_failure(&self, fail: bool) {
        self.with_state(|s| s.dns_failure = fail);
    }

    /// When set, `connect` fails with [`ZkError::ConnectionLoss`].
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.with_state(|s| s.refuse_connections = refuse);
    }

    /// Expire a session server-side: its ephemeral nodes are deleted, its
    /// watches are dropped and its handle reports
    /// [`ConnectionEvent::Expired`]. Returns false for unknown sessions.
    pub fn expire_session(&self, session_id: i64) -> bool {
        self.with_state(|s| {
            match s.sessions.get_mut(&session_id) {
                Some(slot) if slot.alive => {
                    slot.alive = false;
                    slot.connected = false;
                    slot.clear_watches();
                    slot.auths.clear();
                    slot.outbox
                        .push_back(Event::State(ConnectionEvent::Expired));
                }
                _ => return false,
            }
            let dropped = s.drop_ephemerals(session_id);
            info!(session = session_id, ephemerals = dropped, "session expired");
            true
        })
    }

    /// Expire every live session; returns how many were expired.
    pub fn expire_all_sessions(&self) -> usize {
        self.session_ids()
            .into_iter()
            .filter(|id| self.expire_session(*id))
            .count()
    }

    /// Simulate a network partition for one session. The session and its
    /// ephemeral nodes stay alive server-side; requests fail with
    /// [`ZkError::ConnectionLoss`] until [`reconnect_session`] is called.
    ///
    /// [`reconnect_session`]: MemoryEnsemble::reconnect_session
    pub fn disconnect_session(&self, session_id: i64) -> bool {
        self.with_state(|s| match s.sessions.get_mut(&session_id) {
            Some(slot) if slot.alive && slot.connected => {
                slot.connected = false;
                slot.outbox
                    .push_back(Event::State(ConnectionEvent::Disconnected));
                true
            }
            _ => false,
        })
    }

    /// End a partition started by [`disconnect_session`].
    ///
    /// [`disconnect_session`]: MemoryEnsemble::disconnect_session
    pub fn reconnect_session(&self, session_id: i64) -> bool {
        self.with_state(|s| match s.sessions.get_mut(&session_id) {
            Some(slot) if slot.alive && !slot.connected => {
                slot.connected = true;
                slot.outbox
                    .push_back(Event::State(ConnectionEvent::Connected));
                true
            }
            _ => false,
        })
    }

    /// Ids of the live sessions, ascending.
    pub fn session_ids(&self) -> Vec<i64> {
        let state = self.inner.state.lock();
        let mut ids: Vec<i64> = state
            .sessions
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Credentials applied to a session, in the order they were applied.
    pub fn session_credentials(&self, session_id: i64) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .sessions
            .get(&session_id)
            .map(|s| s.credentials.clone())
            .unwrap_or_default()
    }

    /// Identities a session is authenticated as, `scheme:id`.
    pub fn session_auths(&self, session_id: i64) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .sessions
            .get(&session_id)
            .map(|s| {
                s.auths
                    .iter()
                    .map(|(scheme, id)| format!("{scheme}:{id}"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns true if the session holds an armed watch of `kind` on `path`.
    pub fn has_watch(&self, session_id: i64, kind: WatchKind, path: &str) -> bool {
        let state = self.inner.state.lock();
        state
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.watches(kind).contains(path))
    }

    /// Read a node, bypassing ACLs.
    pub fn node(&self, path: &str) -> Option<NodeSnapshot> {
        let state = self.inner.state.lock();
        state.nodes.get(path).map(|n| NodeSnapshot {
            data: n.data.clone(),
            acl: n.acl.clone(),
            stat: n.stat,
        })
    }

    /// Returns true if the node exists.
    pub fn exists(&self, path: &str) -> bool {
        self.inner.state.lock().nodes.contains_key(path)
    }

    /// Sorted child names of a node.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.state.lock().children_of(path)
    }

    /// Create a persistent, world-open node, bypassing ACLs. Watches fire as
    /// for a client create.
    pub fn create_node(&self, path: &str, data: &[u8]) -> ZkResult<String> {
        self.with_state(|s| {
            s.create(
                ADMIN_SESSION,
                path,
                data.to_vec(),
                &Acl::open_unsafe(),
                CreateMode::Persistent,
            )
        })
    }

    /// Create `path` and any missing ancestors as persistent, world-open nodes.
    pub fn ensure_path(&self, path: &str) -> ZkResult<()> {
        if !validate_path(path) {
            return Err(ZkError::BadArguments);
        }
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_path(&current, part);
            match self.create_node(&current, &[]) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Overwrite node data, bypassing ACLs.
    pub fn set_data(&self, path: &str, data: &[u8]) -> ZkResult<Stat> {
        self.with_state(|s| s.set(ADMIN_SESSION, path, data.to_vec(), -1))
    }

    /// Delete a childless node, bypassing ACLs.
    pub fn delete_node(&self, path: &str) -> ZkResult<()> {
        self.with_state(|s| s.delete(ADMIN_SESSION, path, -1))
    }
}

impl Connector for MemoryEnsemble {
    fn connect(&self, params: &ConnectParams) -> ZkResult<Box<dyn SessionHandle>> {
        let session_id = self.with_state(|s| {
            if s.dns_failure {
                return Err(ZkError::DnsFailure);
            }
            if s.refuse_connections || params.hosts.trim().is_empty() {
                return Err(ZkError::ConnectionLoss);
            }
            let id = s.next_session;
            s.next_session += 1;
            let mut slot = SessionSlot {
                alive: true,
                connected: true,
                ..SessionSlot::default()
            };
            slot.outbox
                .push_back(Event::State(ConnectionEvent::Connected));
            s.sessions.insert(id, slot);
            Ok(id)
        })?;
        debug!(session = session_id, hosts = %params.hosts, "memory session opened");
        Ok(Box::new(MemoryHandle {
            inner: self.inner.clone(),
            session_id,
            closed: false,
        }))
    }
}

impl SessionHandle for MemoryHandle {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    fn submit(&mut self, xid: Xid, op: Operation) -> ZkResult<()> {
        if self.closed {
            return Err(ZkError::Closing);
        }
        let mut state = self.inner.state.lock();
        match state.sessions.get(&self.session_id) {
            Some(slot) if !slot.alive => return Err(ZkError::SessionExpired),
            Some(slot) if !slot.connected => return Err(ZkError::ConnectionLoss),
            Some(_) => {}
            None => return Err(ZkError::SessionExpired),
        }
        let result = state.apply(self.session_id, op);
        if let Some(slot) = state.sessions.get_mut(&self.session_id) {
            slot.outbox.push_back(Event::Reply { xid, result });
        }
        drop(state);
        self.inner.cond.notify_all();
        Ok(())
    }

    fn poll(&mut self, wait: Option<Duration>) -> Option<Event> {
        let mut state = self.inner.state.lock();
        let empty = state
            .sessions
            .get(&self.session_id)
            .is_none_or(|s| s.outbox.is_empty());
        if empty {
            if let Some(wait) = wait {
                self.inner.cond.wait_for(&mut state, wait);
            }
        }
        state
            .sessions
            .get_mut(&self.session_id)
            .and_then(|s| s.outbox.pop_front())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let id = self.session_id;
        let dropped = {
            let mut state = self.inner.state.lock();
            let was_alive = state.sessions.remove(&id).is_some_and(|s| s.alive);
            if was_alive { state.drop_ephemerals(id) } else { 0 }
        };
        self.inner.cond.notify_all();
        debug!(session = id, ephemerals = dropped, "memory session closed");
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            hosts: "127.0.0.1:2181".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn reply(handle: &mut Box<dyn SessionHandle>, xid: Xid) -> ZkResult<OpReply> {
        while let Some(event) = handle.poll(None) {
            if let Event::Reply { xid: got, result } = event {
                if got == xid {
                    return result;
                }
            }
        }
        panic!("no reply for {xid}");
    }

    fn create(path: &str, mode: CreateMode) -> Operation {
        Operation::Create {
            path: path.into(),
            data: b"v".to_vec(),
            acl: Acl::open_unsafe(),
            mode,
        }
    }

    #[test]
    fn test_connect_failures() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_dns_failure(true);
        assert_eq!(ensemble.connect(&params()).unwrap_err(), ZkError::DnsFailure);
        ensemble.set_dns_failure(false);
        ensemble.set_refuse_connections(true);
        assert_eq!(
            ensemble.connect(&params()).unwrap_err(),
            ZkError::ConnectionLoss
        );
    }

    #[test]
    fn test_create_and_children() {
        let ensemble = MemoryEnsemble::new();
        let mut h = ensemble.connect(&params()).unwrap();
        assert_eq!(
            h.poll(None),
            Some(Event::State(ConnectionEvent::Connected))
        );
        h.submit(1, create("/svc", CreateMode::Persistent)).unwrap();
        assert_eq!(reply(&mut h, 1), Ok(OpReply::Created("/svc".into())));
        h.submit(2, create("/svc/n-", CreateMode::EphemeralSequential))
            .unwrap();
        assert_eq!(
            reply(&mut h, 2),
            Ok(OpReply::Created("/svc/n-0000000000".into()))
        );
        h.submit(3, create("/missing/a", CreateMode::Persistent))
            .unwrap();
        assert_eq!(reply(&mut h, 3), Err(ZkError::NoNode));
        h.submit(4, create("/svc/n-0000000000/x", CreateMode::Persistent))
            .unwrap();
        assert_eq!(reply(&mut h, 4), Err(ZkError::NoChildrenForEphemerals));
        assert_eq!(ensemble.children("/svc"), vec!["n-0000000000".to_owned()]);
        assert_eq!(ensemble.children("/"), vec!["svc".to_owned()]);
    }

    #[test]
    fn test_watches_are_one_shot() {
        let ensemble = MemoryEnsemble::new();
        ensemble.create_node("/svc", b"").unwrap();
        let mut h = ensemble.connect(&params()).unwrap();
        let id = h.session_id();
        h.submit(1, Operation::GetChildren { path: "/svc".into(), watch: true })
            .unwrap();
        reply(&mut h, 1).unwrap();
        assert!(ensemble.has_watch(id, WatchKind::Child, "/svc"));

        ensemble.create_node("/svc/a", b"").unwrap();
        assert_eq!(
            h.poll(None),
            Some(Event::Watch(WatchedEvent::new(EventType::Child, "/svc")))
        );
        assert!(!ensemble.has_watch(id, WatchKind::Child, "/svc"));
        ensemble.create_node("/svc/b", b"").unwrap();
        assert_eq!(h.poll(None), None);
    }

    #[test]
    fn test_exists_watch_on_missing_node() {
        let ensemble = MemoryEnsemble::new();
        let mut h = ensemble.connect(&params()).unwrap();
        h.poll(None);
        h.submit(1, Operation::Exists { path: "/later".into(), watch: true })
            .unwrap();
        assert_eq!(reply(&mut h, 1), Err(ZkError::NoNode));
        ensemble.create_node("/later", b"x").unwrap();
        assert_eq!(
            h.poll(None),
            Some(Event::Watch(WatchedEvent::new(EventType::Created, "/later")))
        );
    }

    #[test]
    fn test_expire_drops_ephemerals_and_notifies() {
        let ensemble = MemoryEnsemble::new();
        ensemble.create_node("/svc", b"").unwrap();
        let mut owner = ensemble.connect(&params()).unwrap();
        let mut watcher = ensemble.connect(&params()).unwrap();
        owner.submit(1, create("/svc/a", CreateMode::Ephemeral)).unwrap();
        reply(&mut owner, 1).unwrap();
        watcher
            .submit(1, Operation::Exists { path: "/svc/a".into(), watch: true })
            .unwrap();
        reply(&mut watcher, 1).unwrap();

        assert!(ensemble.expire_session(owner.session_id()));
        assert!(!ensemble.exists("/svc/a"));
        assert_eq!(
            watcher.poll(None),
            Some(Event::Watch(WatchedEvent::new(EventType::Deleted, "/svc/a")))
        );
        assert_eq!(owner.poll(None), Some(Event::State(ConnectionEvent::Expired)));
        assert_eq!(
            owner.submit(2, Operation::Exists { path: "/".into(), watch: false }),
            Err(ZkError::SessionExpired)
        );
    }

    #[test]
    fn test_digest_acl() {
        let ensemble = MemoryEnsemble::new();
        let mut h = ensemble.connect(&params()).unwrap();
        h.poll(None);
        h.submit(1, Operation::AddAuth { scheme: "digest".into(), credential: "u:p".into() })
            .unwrap();
        reply(&mut h, 1).unwrap();
        h.submit(
            2,
            Operation::Create {
                path: "/private".into(),
                data: b"s".to_vec(),
                acl: Acl::creator_all(),
                mode: CreateMode::Persistent,
            },
        )
        .unwrap();
        reply(&mut h, 2).unwrap();
        let node = ensemble.node("/private").unwrap();
        assert_eq!(node.acl[0].scheme, DIGEST_SCHEME);
        assert_eq!(node.acl[0].id, auth::digest_id("u:p").unwrap());

        let mut other = ensemble.connect(&params()).unwrap();
        other
            .submit(1, Operation::Get { path: "/private".into(), watch: false })
            .unwrap();
        assert_eq!(reply(&mut other, 1), Err(ZkError::NoAuth));
        assert_eq!(ensemble.session_credentials(h.session_id()), vec!["u:p"]);
    }

    #[test]
    fn test_disconnect_keeps_session() {
        let ensemble = MemoryEnsemble::new();
        let mut h = ensemble.connect(&params()).unwrap();
        h.poll(None);
        h.submit(1, create("/e", CreateMode::Ephemeral)).unwrap();
        reply(&mut h, 1).unwrap();
        assert!(ensemble.disconnect_session(h.session_id()));
        assert_eq!(
            h.submit(2, Operation::Exists { path: "/e".into(), watch: false }),
            Err(ZkError::ConnectionLoss)
        );
        assert!(ensemble.exists("/e"));
        assert!(ensemble.reconnect_session(h.session_id()));
        assert_eq!(h.poll(None), Some(Event::State(ConnectionEvent::Disconnected)));
        assert_eq!(h.poll(None), Some(Event::State(ConnectionEvent::Connected)));
        h.close();
        assert!(!ensemble.exists("/e"));
    }
}
