//! Coordination-service session with transparent recovery.
//!
//! [`CoordinationSession`] owns at most one live [`SessionHandle`]. It
//! records every watch, ephemeral node and digest credential requested through
//! it, and replays all three whenever a handle (re)connects, including the
//! brand new handle opened after the server expired the previous one.
//!
//! Nothing here spawns threads. Completions and watch events are delivered from
//! [`CoordinationSession::update`], which the owner calls from its loop. Every
//! node operation comes in two flavours: `a*` returns a [`Pending`] that
//! resolves on a later `update`, the plain form pumps `update` until the reply
//! arrives or the session timeout elapses.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::channel::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::{
    auth,
    backend::{
        ConnectParams, ConnectionEvent, Connector, Event, OpReply, Operation, SessionHandle, Xid,
    },
    error::{ZkError, ZkResult},
    metrics,
    models::{
        Acl, CreateMode, DIGEST_SCHEME, EphemeralNode, Stat, WatchKind, WatchedEvent,
        validate_path,
    },
};

/// Default negotiated session timeout
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait of a blocking `update`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Base delay for retrying a failed connect.
pub const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for connect retry backoff.
pub const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);
/// events handled by a single `update`
const MAX_EVENTS_PER_UPDATE: usize = 256;

/// Immutable connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// comma separated `host:port` list
    pub hosts: String,
    /// session timeout, also the deadline of every blocking call
    pub timeout: Duration,
    /// server path every client path is relative to
    pub chroot: Option<String>,
    /// how long a blocking `update` waits for the first event
    pub poll_interval: Duration,
    /// first reconnect delay after a failed connect
    pub reconnect_base: Duration,
    /// reconnect delay cap
    pub reconnect_max: Duration,
}

impl SessionConfig {
    /// Config for `hosts` with default timings and no chroot.
    pub fn new(hosts: impl Into<String>) -> Self {
        Self {
            hosts: hosts.into(),
            ..Self::default()
        }
    }

    /// Set the chroot. `None`, `""` and `"/"` all mean no chroot.
    pub fn with_chroot(mut self, chroot: Option<String>) -> Self {
        self.chroot = chroot.filter(|c| !c.is_empty() && c != "/");
        self
    }

    /// Set the session timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reconnect backoff range.
    pub fn with_reconnect(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hosts: "127.0.0.1:2181".to_owned(),
            timeout: DEFAULT_SESSION_TIMEOUT,
            chroot: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_base: CONNECT_RETRY_BASE_DELAY,
            reconnect_max: MAX_CONNECT_RETRY_DELAY,
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// constructed, never connected
    Init,
    /// a handle is being opened, or a connect retry is scheduled
    Connecting,
    /// live
    Connected,
    /// transient disconnect; the server may still hold the session
    Suspended,
    /// server-confirmed session loss, recovery pending
    Expired,
    /// explicitly shut down; terminal
    Closed,
}

impl SessionState {
    /// lowercase name, used as a metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Suspended => "suspended",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an async session operation. Resolves on a later
/// [`CoordinationSession::update`]; poll it with [`Pending::try_take`] or
/// `.await` it from a task driven by the same loop.
pub struct Pending<T> {
    rx: oneshot::Receiver<ZkResult<T>>,
}

impl<T> Pending<T> {
    fn channel() -> (oneshot::Sender<ZkResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn ready(result: ZkResult<T>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Take the result if it has arrived. A completion dropped without an
    /// answer (session closed) yields [`ZkError::Closing`].
    pub fn try_take(&mut self) -> Option<ZkResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::Canceled) => Some(Err(ZkError::Closing)),
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

impl<T> Future for Pending<T> {
    type Output = ZkResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ZkError::Closing)))
    }
}

/// What the session must replay after a reconnect. Paths are client paths.
#[derive(Debug, Default)]
struct Registrations {
    credentials: Vec<String>,
    get_watches: BTreeSet<String>,
    child_watches: BTreeSet<String>,
    exists_watches: BTreeSet<String>,
    ephemeral: BTreeMap<String, EphemeralNode>,
    /// requests issued from completions, submitted at the end of `update`
    followups: Vec<Operation>,
}

impl Registrations {
    fn watches(&self, kind: WatchKind) -> &BTreeSet<String> {
        match kind {
            WatchKind::Data => &self.get_watches,
            WatchKind::Child => &self.child_watches,
            WatchKind::Exists => &self.exists_watches,
        }
    }

    fn watches_mut(&mut self, kind: WatchKind) -> &mut BTreeSet<String> {
        match kind {
            WatchKind::Data => &mut self.get_watches,
            WatchKind::Child => &mut self.child_watches,
            WatchKind::Exists => &mut self.exists_watches,
        }
    }

    fn is_watched(&self, path: &str) -> bool {
        self.get_watches.contains(path)
            || self.child_watches.contains(path)
            || self.exists_watches.contains(path)
    }
}

type Completion = Box<dyn FnOnce(&mut Registrations, ZkResult<OpReply>)>;
type WatchCallback = Box<dyn FnMut(&WatchedEvent)>;
type OneShotWatcher = Box<dyn FnOnce(&WatchedEvent)>;

fn complete<T: 'static>(
    tx: oneshot::Sender<ZkResult<T>>,
    map: impl FnOnce(&mut Registrations, ZkResult<OpReply>) -> ZkResult<T> + 'static,
) -> Completion {
    Box::new(move |regs, result| {
        let _ = tx.send(map(regs, result));
    })
}

fn chroot_path(chroot: Option<&str>, path: &str) -> String {
    match chroot {
        None => path.to_owned(),
        Some(root) if path == "/" => root.to_owned(),
        Some(root) => format!("{root}{path}"),
    }
}

fn strip_chroot(chroot: Option<&str>, path: &str) -> String {
    match chroot.and_then(|root| path.strip_prefix(root)) {
        Some("") => "/".to_owned(),
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => path.to_owned(),
    }
}

/// Coordination-service session wrapper.
pub struct CoordinationSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    handle: Option<Box<dyn SessionHandle>>,
    state: SessionState,
    epoch: u64,
    next_xid: Xid,
    pending: HashMap<Xid, Completion>,
    regs: Registrations,
    watch_callback: Option<WatchCallback>,
    watch_queue: VecDeque<WatchedEvent>,
    one_shot: HashMap<String, Vec<OneShotWatcher>>,
    connect_waiters: Vec<oneshot::Sender<ZkResult<()>>>,
    retry_attempt: u32,
    retry_at: Option<Instant>,
    recovering: bool,
}

impl fmt::Debug for CoordinationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationSession")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("session_id", &self.session_id())
            .field("pending", &self.pending.len())
            .field("registrations", &self.regs)
            .finish_non_exhaustive()
    }
}

impl CoordinationSession {
    /// Make a new session; nothing happens until [`connect`] is called.
    ///
    /// [`connect`]: CoordinationSession::connect
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            handle: None,
            state: SessionState::Init,
            epoch: 0,
            next_xid: 0,
            pending: HashMap::new(),
            regs: Registrations::default(),
            watch_callback: None,
            watch_queue: VecDeque::new(),
            one_shot: HashMap::new(),
            connect_waiters: Vec::new(),
            retry_attempt: 0,
            retry_at: None,
            recovering: false,
        }
    }

    /// connection parameters
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Incremented on every successful (re)connect.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// id of the live handle, if any
    pub fn session_id(&self) -> Option<i64> {
        self.handle.as_ref().map(|h| h.session_id())
    }

    /// requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Paths with a tracked watch of `kind`, sorted.
    pub fn watched(&self, kind: WatchKind) -> Vec<String> {
        self.regs.watches(kind).iter().cloned().collect()
    }

    /// Ephemeral nodes this session created and has not deleted, by path.
    pub fn ephemeral_nodes(&self) -> Vec<EphemeralNode> {
        self.regs.ephemeral.values().cloned().collect()
    }

    /// Applied digest credentials, in registration order.
    pub fn credentials(&self) -> &[String] {
        &self.regs.credentials
    }

    // -----------------------------------------------------------------------
    // connection lifecycle
    // -----------------------------------------------------------------------

    /// Start connecting. The returned [`Pending`] resolves once the handle
    /// reports connected and [`on_connected`] ran, or immediately with the
    /// connect error ([`ZkError::DnsFailure`] when the hosts do not resolve).
    /// A failed attempt also schedules a retry with exponential backoff.
    ///
    /// [`on_connected`]: CoordinationSession::on_connected
    pub fn connect(&mut self) -> Pending<()> {
        match self.state {
            SessionState::Closed => return Pending::ready(Err(ZkError::Closing)),
            SessionState::Connected => return Pending::ready(Ok(())),
            _ => {}
        }
        if self.handle.is_none() {
            if let Err(err) = self.open_handle() {
                return Pending::ready(Err(err));
            }
        }
        let (tx, pending) = Pending::channel();
        self.connect_waiters.push(tx);
        pending
    }

    /// Blocking [`connect`](CoordinationSession::connect).
    pub fn connect_blocking(&mut self) -> ZkResult<()> {
        let pending = self.connect();
        self.wait(pending)
    }

    fn open_handle(&mut self) -> ZkResult<()> {
        self.set_state(SessionState::Connecting);
        let params = ConnectParams {
            hosts: self.config.hosts.clone(),
            timeout: self.config.timeout,
        };
        match self.connector.connect(&params) {
            Ok(handle) => {
                debug!(session = handle.session_id(), hosts = %self.config.hosts, "coordination handle opened");
                self.handle = Some(handle);
                self.retry_at = None;
                Ok(())
            }
            Err(err) => {
                let label = err.to_string();
                metrics::CONNECT_FAILED
                    .with_label_values(&[label.as_str()])
                    .inc();
                let delay = self
                    .config
                    .reconnect_base
                    .saturating_mul(2u32.saturating_pow(self.retry_attempt))
                    .min(self.config.reconnect_max);
                self.retry_attempt = self.retry_attempt.saturating_add(1);
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    attempt = self.retry_attempt,
                    retry_in_ms = delay.as_millis(),
                    error = %err,
                    "coordination connect failed, retrying"
                );
                Err(err)
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "coordination session state");
            metrics::STATE_TRANSITIONS
                .with_label_values(&[state.as_str()])
                .inc();
            self.state = state;
        }
    }

    fn note_error(&mut self, err: ZkError) {
        match err {
            ZkError::SessionExpired => self.set_state(SessionState::Expired),
            ZkError::ConnectionLoss if self.state == SessionState::Connected => {
                self.set_state(SessionState::Suspended)
            }
            _ => {}
        }
    }

    fn handle_connected(&mut self) {
        self.set_state(SessionState::Connected);
        self.epoch += 1;
        self.retry_attempt = 0;
        self.retry_at = None;
        if std::mem::take(&mut self.recovering) {
            metrics::SESSION_RECOVERED.inc();
        }
        info!(session = ?self.session_id(), epoch = self.epoch, "coordination session connected");
        self.on_connected();
        for tx in self.connect_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Drop the expired handle, fail what was in flight on it, and open a new
    /// one. Registrations are kept for replay.
    fn recover(&mut self) {
        warn!(session = ?self.session_id(), epoch = self.epoch, "coordination session expired, recovering");
        metrics::SESSION_EXPIRED.inc();
        self.recovering = true;
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.fail_pending(ZkError::SessionExpired);
        self.regs.followups.clear();
        self.retry_attempt = 0;
        // a failure here is logged and retried from `update`
        let _ = self.open_handle();
    }

    fn fail_pending(&mut self, err: ZkError) {
        let mut pending: Vec<(Xid, Completion)> = self.pending.drain().collect();
        pending.sort_unstable_by_key(|(xid, _)| *xid);
        for (_, done) in pending {
            done(&mut self.regs, Err(err));
        }
    }

    /// Replay everything the session tracks onto the live handle. Runs on
    /// every successful (re)connect; exposed for hosts that manage the
    /// connection themselves.
    ///
    /// Credentials go first, in registration order, so `auth` ACLs and digest
    /// protected nodes resolve. Ephemeral nodes are recreated next with their
    /// original value and ACL; an existing node counts as success. Watches are
    /// re-armed last so the session's own recreations do not consume them.
    pub fn on_connected(&mut self) {
        let credentials = self.regs.credentials.clone();
        for credential in credentials {
            self.submit(
                Operation::AddAuth {
                    scheme: DIGEST_SCHEME.to_owned(),
                    credential,
                },
                Box::new(|_, result| {
                    if let Err(err) = result {
                        error!(?err, "failed to re-apply credential");
                    }
                }),
            );
        }

        let nodes: Vec<EphemeralNode> = self.regs.ephemeral.values().cloned().collect();
        for node in nodes {
            let path = node.path.clone();
            self.submit(
                Operation::Create {
                    path: self.server_path(&node.path),
                    data: node.value,
                    acl: node.acl,
                    mode: CreateMode::Ephemeral,
                },
                Box::new(move |_, result| match result {
                    Ok(_) => {
                        metrics::EPHEMERALS_RECREATED.inc();
                        debug!(%path, "ephemeral node recreated");
                    }
                    Err(ZkError::NodeExists) => debug!(%path, "ephemeral node already present"),
                    Err(err) => warn!(%path, ?err, "failed to recreate ephemeral node"),
                }),
            );
        }

        for kind in [WatchKind::Data, WatchKind::Child, WatchKind::Exists] {
            let paths = self.watched(kind);
            for path in paths {
                let server = self.server_path(&path);
                let op = match kind {
                    WatchKind::Data => Operation::Get {
                        path: server.clone(),
                        watch: true,
                    },
                    WatchKind::Child => Operation::GetChildren {
                        path: server.clone(),
                        watch: true,
                    },
                    WatchKind::Exists => Operation::Exists {
                        path: server.clone(),
                        watch: true,
                    },
                };
                self.submit(
                    op,
                    Box::new(move |regs, result| match result {
                        Ok(_) => trace!(%path, %kind, "watch re-armed"),
                        // data and child watches need the node; wait for it instead
                        Err(ZkError::NoNode) if kind != WatchKind::Exists => {
                            regs.followups.push(Operation::Exists {
                                path: server,
                                watch: true,
                            });
                        }
                        Err(ZkError::NoNode) => trace!(%path, "exists watch re-armed on absent node"),
                        Err(err) => warn!(%path, %kind, ?err, "failed to re-arm watch"),
                    }),
                );
            }
        }
    }

    /// Pump completions and watch events. Returns how many were processed.
    /// With `blocking`, waits up to one poll interval for the first event.
    pub fn update(&mut self, blocking: bool) -> usize {
        if self.state == SessionState::Closed {
            return 0;
        }
        let mut count = 0;
        if self.state == SessionState::Expired {
            self.recover();
            count += 1;
        }
        if self.handle.is_none() && self.retry_at.is_some_and(|at| Instant::now() >= at) {
            // errors are logged and rescheduled by open_handle
            let _ = self.open_handle();
            count += 1;
        }

        let mut wait = blocking.then_some(self.config.poll_interval);
        while count < MAX_EVENTS_PER_UPDATE {
            let Some(handle) = self.handle.as_mut() else {
                break;
            };
            let Some(event) = handle.poll(wait.take()) else {
                break;
            };
            count += 1;
            self.handle_event(event);
            if self.state == SessionState::Expired {
                self.recover();
            }
        }
        self.flush_followups();

        if blocking && count == 0 && self.handle.is_none() {
            std::thread::sleep(self.config.poll_interval);
        }
        count
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Reply { xid, result } => {
                if let Err(err) = result {
                    self.note_error(err);
                }
                match self.pending.remove(&xid) {
                    Some(done) => done(&mut self.regs, result),
                    None => trace!(xid, "reply for unknown request"),
                }
            }
            Event::Watch(event) => self.deliver_watch(event),
            Event::State(ConnectionEvent::Connected) => self.handle_connected(),
            Event::State(ConnectionEvent::Disconnected) => {
                warn!(session = ?self.session_id(), "coordination connection lost");
                self.set_state(SessionState::Suspended);
            }
            Event::State(ConnectionEvent::Expired) => self.set_state(SessionState::Expired),
            Event::State(ConnectionEvent::AuthFailed) => {
                error!(session = ?self.session_id(), "coordination authentication failed");
            }
        }
    }

    fn flush_followups(&mut self) {
        for op in std::mem::take(&mut self.regs.followups) {
            let name = op.name();
            self.submit(
                op,
                Box::new(move |_, result| {
                    if let Err(err) = result.map(|_| ()) {
                        if err != ZkError::NoNode {
                            warn!(op = name, ?err, "follow-up request failed");
                        }
                    }
                }),
            );
        }
    }

    fn submit(&mut self, op: Operation, done: Completion) {
        if self.state == SessionState::Closed {
            done(&mut self.regs, Err(ZkError::Closing));
            return;
        }
        let Some(handle) = self.handle.as_mut() else {
            done(&mut self.regs, Err(ZkError::ConnectionLoss));
            return;
        };
        self.next_xid += 1;
        let xid = self.next_xid;
        trace!(xid, op = op.name(), path = ?op.path(), "submit");
        match handle.submit(xid, op) {
            Ok(()) => {
                self.pending.insert(xid, done);
            }
            Err(err) => {
                self.note_error(err);
                done(&mut self.regs, Err(err));
            }
        }
    }

    fn wait<T>(&mut self, mut pending: Pending<T>) -> ZkResult<T> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if let Some(result) = pending.try_take() {
                return result;
            }
            if Instant::now() >= deadline {
                return Err(ZkError::OperationTimeout);
            }
            self.update(true);
        }
    }

    fn server_path(&self, path: &str) -> String {
        chroot_path(self.config.chroot.as_deref(), path)
    }

    fn checked_path(&self, path: &str) -> ZkResult<String> {
        if validate_path(path) {
            Ok(self.server_path(path))
        } else {
            Err(ZkError::BadArguments)
        }
    }

    // -----------------------------------------------------------------------
    // watches
    // -----------------------------------------------------------------------

    /// Install the session-wide watch sink. Without one, fired watches queue
    /// up for [`next_watch_event`](CoordinationSession::next_watch_event).
    pub fn set_watch_callback(&mut self, callback: impl FnMut(&WatchedEvent) + 'static) {
        self.watch_callback = Some(Box::new(callback));
    }

    /// Next queued watch event.
    pub fn next_watch_event(&mut self) -> Option<WatchedEvent> {
        self.watch_queue.pop_front()
    }

    /// Stop tracking a watch. It is no longer replayed and its events are no
    /// longer delivered. Returns false if it was not tracked.
    pub fn cancel_watch(&mut self, path: &str, kind: WatchKind) -> bool {
        self.regs.watches_mut(kind).remove(path)
    }

    fn deliver_watch(&mut self, event: WatchedEvent) {
        let event = WatchedEvent::new(
            event.event_type,
            strip_chroot(self.config.chroot.as_deref(), &event.path),
        );
        let watchers = self.one_shot.remove(&event.path).unwrap_or_default();
        let tracked = !watchers.is_empty() || self.regs.is_watched(&event.path);
        for watcher in watchers {
            watcher(&event);
        }
        if !tracked {
            trace!(path = %event.path, "event for cancelled watch dropped");
            return;
        }
        debug!(path = %event.path, event_type = ?event.event_type, "watch fired");
        match self.watch_callback.as_mut() {
            Some(callback) => callback(&event),
            None => self.watch_queue.push_back(event),
        }
    }

    // -----------------------------------------------------------------------
    // node operations
    // -----------------------------------------------------------------------

    /// Create a node; resolves to the created (sequence-resolved) path.
    /// Ephemeral nodes are tracked for recreation after recovery.
    pub fn acreate(
        &mut self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Pending<String> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        let (tx, pending) = Pending::channel();
        let chroot = self.config.chroot.clone();
        let value = data.to_vec();
        let node_acl = acl.to_vec();
        self.submit(
            Operation::Create {
                path: server,
                data: data.to_vec(),
                acl: acl.to_vec(),
                mode,
            },
            complete(tx, move |regs, result| {
                let created = match result? {
                    OpReply::Created(path) => strip_chroot(chroot.as_deref(), &path),
                    _ => return Err(ZkError::MarshallingError),
                };
                if mode.is_ephemeral() {
                    regs.ephemeral.insert(
                        created.clone(),
                        EphemeralNode {
                            path: created.clone(),
                            value,
                            acl: node_acl,
                        },
                    );
                }
                Ok(created)
            }),
        );
        pending
    }

    /// Blocking [`acreate`](CoordinationSession::acreate).
    pub fn create(
        &mut self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String> {
        let pending = self.acreate(path, data, acl, mode);
        self.wait(pending)
    }

    /// Read node data, optionally tracking a data watch.
    pub fn aget(&mut self, path: &str, watch: bool) -> Pending<(Vec<u8>, Stat)> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        if watch {
            self.regs.get_watches.insert(path.to_owned());
        }
        let (tx, pending) = Pending::channel();
        self.submit(
            Operation::Get {
                path: server.clone(),
                watch,
            },
            complete(tx, move |regs, result| match result {
                Ok(OpReply::Data(data, stat)) => Ok((data, stat)),
                Ok(_) => Err(ZkError::MarshallingError),
                Err(ZkError::NoNode) if watch => {
                    regs.followups.push(Operation::Exists {
                        path: server,
                        watch: true,
                    });
                    Err(ZkError::NoNode)
                }
                Err(err) => Err(err),
            }),
        );
        pending
    }

    /// Blocking [`aget`](CoordinationSession::aget).
    pub fn get(&mut self, path: &str, watch: bool) -> ZkResult<(Vec<u8>, Stat)> {
        let pending = self.aget(path, watch);
        self.wait(pending)
    }

    /// Write node data; `version` -1 matches any version.
    pub fn aset(&mut self, path: &str, data: &[u8], version: i32) -> Pending<Stat> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        let (tx, pending) = Pending::channel();
        self.submit(
            Operation::Set {
                path: server,
                data: data.to_vec(),
                version,
            },
            complete(tx, |_, result| match result? {
                OpReply::Stat(stat) => Ok(stat),
                _ => Err(ZkError::MarshallingError),
            }),
        );
        pending
    }

    /// Blocking [`aset`](CoordinationSession::aset).
    pub fn set(&mut self, path: &str, data: &[u8], version: i32) -> ZkResult<Stat> {
        let pending = self.aset(path, data, version);
        self.wait(pending)
    }

    /// Delete a node. An ephemeral node deleted this way (or found already
    /// gone) is no longer recreated on recovery.
    pub fn adelete(&mut self, path: &str, version: i32) -> Pending<()> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        let (tx, pending) = Pending::channel();
        let path = path.to_owned();
        self.submit(
            Operation::Delete {
                path: server,
                version,
            },
            complete(tx, move |regs, result| match result {
                Ok(_) => {
                    regs.ephemeral.remove(&path);
                    Ok(())
                }
                Err(ZkError::NoNode) => {
                    regs.ephemeral.remove(&path);
                    Err(ZkError::NoNode)
                }
                Err(err) => Err(err),
            }),
        );
        pending
    }

    /// Blocking [`adelete`](CoordinationSession::adelete).
    pub fn delete(&mut self, path: &str, version: i32) -> ZkResult<()> {
        let pending = self.adelete(path, version);
        self.wait(pending)
    }

    /// Stat a node; `None` when it does not exist. A watch is armed either
    /// way when requested.
    pub fn aexists(&mut self, path: &str, watch: bool) -> Pending<Option<Stat>> {
        if watch && validate_path(path) {
            self.regs.exists_watches.insert(path.to_owned());
        }
        self.exists_inner(path, watch)
    }

    /// Blocking [`aexists`](CoordinationSession::aexists).
    pub fn exists(&mut self, path: &str, watch: bool) -> ZkResult<Option<Stat>> {
        let pending = self.aexists(path, watch);
        self.wait(pending)
    }

    /// [`aexists`](CoordinationSession::aexists) with a watcher invoked once
    /// when this watch fires, besides the session-wide sink. The watcher is
    /// not replayed after recovery.
    pub fn aexists_with(
        &mut self,
        path: &str,
        watcher: impl FnOnce(&WatchedEvent) + 'static,
    ) -> Pending<Option<Stat>> {
        if validate_path(path) {
            self.one_shot
                .entry(path.to_owned())
                .or_default()
                .push(Box::new(watcher));
        }
        self.exists_inner(path, true)
    }

    /// Blocking [`aexists_with`](CoordinationSession::aexists_with).
    pub fn exists_with(
        &mut self,
        path: &str,
        watcher: impl FnOnce(&WatchedEvent) + 'static,
    ) -> ZkResult<Option<Stat>> {
        let pending = self.aexists_with(path, watcher);
        self.wait(pending)
    }

    fn exists_inner(&mut self, path: &str, watch: bool) -> Pending<Option<Stat>> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        let (tx, pending) = Pending::channel();
        self.submit(
            Operation::Exists {
                path: server,
                watch,
            },
            complete(tx, |_, result| match result {
                Ok(OpReply::Stat(stat)) => Ok(Some(stat)),
                Ok(_) => Err(ZkError::MarshallingError),
                Err(ZkError::NoNode) => Ok(None),
                Err(err) => Err(err),
            }),
        );
        pending
    }

    /// List child names, sorted, optionally tracking a child watch.
    pub fn aget_children(&mut self, path: &str, watch: bool) -> Pending<Vec<String>> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        if watch {
            self.regs.child_watches.insert(path.to_owned());
        }
        let (tx, pending) = Pending::channel();
        self.submit(
            Operation::GetChildren {
                path: server.clone(),
                watch,
            },
            complete(tx, move |regs, result| match result {
                Ok(OpReply::Children(children, _)) => Ok(children),
                Ok(_) => Err(ZkError::MarshallingError),
                Err(ZkError::NoNode) if watch => {
                    regs.followups.push(Operation::Exists {
                        path: server,
                        watch: true,
                    });
                    Err(ZkError::NoNode)
                }
                Err(err) => Err(err),
            }),
        );
        pending
    }

    /// Blocking [`aget_children`](CoordinationSession::aget_children).
    pub fn get_children(&mut self, path: &str, watch: bool) -> ZkResult<Vec<String>> {
        let pending = self.aget_children(path, watch);
        self.wait(pending)
    }

    /// Read a node ACL.
    pub fn aget_acl(&mut self, path: &str) -> Pending<(Vec<Acl>, Stat)> {
        let server = match self.checked_path(path) {
            Ok(server) => server,
            Err(err) => return Pending::ready(Err(err)),
        };
        let (tx, pending) = Pending::channel();
        self.submit(
            Operation::GetAcl { path: server },
            complete(tx, |_, result| match result? {
                OpReply::Acl(acl, stat) => Ok((acl, stat)),
                _ => Err(ZkError::MarshallingError),
            }),
        );
        pending
    }

    /// Blocking [`aget_acl`](CoordinationSession::aget_acl).
    pub fn get_acl(&mut self, path: &str) -> ZkResult<(Vec<Acl>, Stat)> {
        let pending = self.aget_acl(path);
        self.wait(pending)
    }

    /// Apply a `user:password` digest credential. It is recorded before it
    /// is sent, so it is re-applied after recovery even if this attempt
    /// fails on a dropped connection.
    pub fn aadd_digest_auth(&mut self, credential: &str) -> Pending<()> {
        if let Err(err) = auth::digest_id(credential) {
            return Pending::ready(Err(err));
        }
        if !self.regs.credentials.iter().any(|c| c == credential) {
            self.regs.credentials.push(credential.to_owned());
        }
        let (tx, pending) = Pending::channel();
        self.submit(
            Operation::AddAuth {
                scheme: DIGEST_SCHEME.to_owned(),
                credential: credential.to_owned(),
            },
            complete(tx, |_, result| result.map(|_| ())),
        );
        pending
    }

    /// Blocking [`aadd_digest_auth`](CoordinationSession::aadd_digest_auth).
    pub fn add_digest_auth(&mut self, credential: &str) -> ZkResult<()> {
        let pending = self.aadd_digest_auth(credential);
        self.wait(pending)
    }

    /// Tear the session down. With `clean`, owned ephemeral nodes are deleted
    /// first (best effort). Everything tracked is forgotten and later calls
    /// fail with [`ZkError::Closing`].
    pub fn close(&mut self, clean: bool) {
        if self.state == SessionState::Closed {
            return;
        }
        if clean && self.handle.is_some() {
            let paths: Vec<String> = self.regs.ephemeral.keys().rev().cloned().collect();
            for path in paths {
                let pending = self.adelete(&path, -1);
                match self.wait(pending) {
                    Ok(()) | Err(ZkError::NoNode) => {}
                    Err(err) => warn!(%path, ?err, "failed to delete ephemeral node on close"),
                }
            }
        }
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.set_state(SessionState::Closed);
        self.fail_pending(ZkError::Closing);
        for tx in self.connect_waiters.drain(..) {
            let _ = tx.send(Err(ZkError::Closing));
        }
        self.regs = Registrations::default();
        self.one_shot.clear();
        self.watch_queue.clear();
        self.retry_at = None;
        info!(clean, "coordination session closed");
    }
}

impl Drop for CoordinationSession {
    fn drop(&mut self) {
        self.close(false);
    }
}
