//! Resolver backed by the coordination service.
//!
//! A name `a/b` lives at `<root>/a/b`; every child of that node is one
//! instance whose data is the instance URL. Each tracked name carries a child
//! watch. When it fires, or when the session epoch moves (the session
//! reconnected or was rebuilt after expiry), the children are listed again and
//! their values fetched asynchronously. A change is reported only when the
//! sorted URL set differs from the last one reported.
use std::{collections::BTreeMap, mem, sync::Arc};

use coordination::{
    Acl, Connector, CoordinationSession, CreateMode, EventType, Pending, SessionState, Stat,
    WatchKind, ZkError,
    models::{join_path, validate_path},
};
use tracing::{debug, trace, warn};

use crate::{
    NameChange, Naming, NamingConfig, NamingError, NamingFactory, NamingResult, NamingType,
    normalize_urls, validate_name,
};

#[derive(Debug, Default)]
enum Fetch {
    #[default]
    Idle,
    Listing(Pending<Vec<String>>),
    Reading {
        reads: Vec<(String, Pending<(Vec<u8>, Stat)>)>,
        urls: Vec<String>,
        /// a read failed; the set is incomplete and must not be reported
        failed: bool,
    },
}

#[derive(Debug, Default)]
struct NameEntry {
    /// last reported set
    urls: Vec<String>,
    fetch: Fetch,
    /// a re-list is needed
    dirty: bool,
}

/// Advance one name's fetch. Returns the URL set once a fetch completes.
fn advance(
    session: &mut CoordinationSession,
    path: &str,
    entry: &mut NameEntry,
) -> Option<Vec<String>> {
    match mem::take(&mut entry.fetch) {
        Fetch::Idle => {
            if entry.dirty && session.state() == SessionState::Connected {
                entry.dirty = false;
                entry.fetch = Fetch::Listing(session.aget_children(path, true));
            }
            None
        }
        Fetch::Listing(mut pending) => match pending.try_take() {
            None => {
                entry.fetch = Fetch::Listing(pending);
                None
            }
            Some(Ok(children)) if children.is_empty() => Some(Vec::new()),
            Some(Ok(children)) => {
                let reads = children
                    .into_iter()
                    .map(|child| {
                        let pending = session.aget(&join_path(path, &child), false);
                        (child, pending)
                    })
                    .collect();
                entry.fetch = Fetch::Reading {
                    reads,
                    urls: Vec::new(),
                    failed: false,
                };
                None
            }
            // the session falls back to an exists watch; creation relists
            Some(Err(ZkError::NoNode)) => Some(Vec::new()),
            Some(Err(err)) => {
                warn!(%path, ?err, "listing service instances failed");
                entry.dirty = true;
                None
            }
        },
        Fetch::Reading {
            reads,
            mut urls,
            mut failed,
        } => {
            let mut waiting = Vec::new();
            for (child, mut pending) in reads {
                match pending.try_take() {
                    None => waiting.push((child, pending)),
                    Some(Ok((data, _))) => urls.push(String::from_utf8_lossy(&data).into_owned()),
                    // instance went away between list and read
                    Some(Err(ZkError::NoNode)) => {}
                    Some(Err(err)) => {
                        warn!(%path, %child, ?err, "reading service instance failed");
                        failed = true;
                    }
                }
            }
            if !waiting.is_empty() {
                entry.fetch = Fetch::Reading {
                    reads: waiting,
                    urls,
                    failed,
                };
                None
            } else if failed {
                // keep the last reported set until a relist succeeds
                entry.dirty = true;
                None
            } else {
                Some(urls)
            }
        }
    }
}

/// Coordination-service backed resolver.
#[derive(Debug)]
pub struct CoordinationNaming {
    session: CoordinationSession,
    root: String,
    names: BTreeMap<String, NameEntry>,
    changes: Vec<NameChange>,
    seen_epoch: u64,
}

impl CoordinationNaming {
    /// Wrap `session`, starting a connect if it never connected. Names live
    /// under `root`.
    pub fn new(mut session: CoordinationSession, root: &str) -> NamingResult<Self> {
        if !validate_path(root) {
            return Err(NamingError::InvalidName(root.to_owned()));
        }
        if session.state() == SessionState::Init {
            // completion shows up as an epoch change in `update`
            let _ = session.connect();
        }
        Ok(Self {
            session,
            root: root.to_owned(),
            names: BTreeMap::new(),
            changes: Vec::new(),
            seen_epoch: 0,
        })
    }

    /// the underlying session
    pub fn session(&self) -> &CoordinationSession {
        &self.session
    }

    /// the underlying session, for direct node access
    pub fn session_mut(&mut self) -> &mut CoordinationSession {
        &mut self.session
    }

    fn name_path(&self, name: &str) -> String {
        join_path(&self.root, name)
    }

    /// the tracked name a node path belongs to
    fn name_for(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(self.root.as_str())?;
        let name = if self.root == "/" {
            rest
        } else {
            rest.strip_prefix('/')?
        };
        self.names.contains_key(name).then(|| name.to_owned())
    }

    fn ensure_connected(&mut self) -> NamingResult<()> {
        if self.session.state() != SessionState::Connected {
            self.session.connect_blocking()?;
        }
        Ok(())
    }

    /// Create every missing node from `/` down to `path`.
    fn ensure_persistent(&mut self, path: &str) -> NamingResult<()> {
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_path(&current, part);
            match self.session.create(
                &current,
                &[],
                &Acl::open_unsafe(),
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl Naming for CoordinationNaming {
    fn naming_type(&self) -> NamingType {
        NamingType::Coordination
    }

    fn watch_name(&mut self, name: &str) -> NamingResult<()> {
        validate_name(name)?;
        let entry = self.names.entry(name.to_owned()).or_default();
        if matches!(entry.fetch, Fetch::Idle) && !entry.dirty {
            debug!(name, "watching service name");
            entry.dirty = true;
        }
        Ok(())
    }

    fn unwatch_name(&mut self, name: &str) -> NamingResult<()> {
        if self.names.remove(name).is_none() {
            return Err(NamingError::NotFound(name.to_owned()));
        }
        let path = self.name_path(name);
        self.session.cancel_watch(&path, WatchKind::Child);
        self.session.cancel_watch(&path, WatchKind::Exists);
        Ok(())
    }

    fn get_urls(&self, name: &str) -> Option<&[String]> {
        self.names.get(name).map(|entry| entry.urls.as_slice())
    }

    fn resolve_blocking(&mut self, name: &str) -> NamingResult<Vec<String>> {
        validate_name(name)?;
        self.ensure_connected()?;
        let path = self.name_path(name);
        let children = match self.session.get_children(&path, false) {
            Ok(children) => children,
            Err(ZkError::NoNode) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut urls = Vec::with_capacity(children.len());
        for child in children {
            match self.session.get(&join_path(&path, &child), false) {
                Ok((data, _)) => urls.push(String::from_utf8_lossy(&data).into_owned()),
                Err(ZkError::NoNode) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(normalize_urls(urls))
    }

    fn register(&mut self, name: &str, url: &str, instance: &str) -> NamingResult<()> {
        validate_name(name)?;
        if instance.is_empty() || instance.contains('/') {
            return Err(NamingError::InvalidName(instance.to_owned()));
        }
        self.ensure_connected()?;
        let path = self.name_path(name);
        self.ensure_persistent(&path)?;
        let node = join_path(&path, instance);
        self.session.create(
            &node,
            url.as_bytes(),
            &Acl::open_unsafe(),
            CreateMode::Ephemeral,
        )?;
        debug!(name, instance, url, "service instance registered");
        Ok(())
    }

    fn unregister(&mut self, name: &str, instance: &str) -> NamingResult<()> {
        validate_name(name)?;
        let node = join_path(&self.name_path(name), instance);
        match self.session.delete(&node, -1) {
            Ok(()) => Ok(()),
            Err(ZkError::NoNode) => Err(NamingError::NotFound(format!("{name}/{instance}"))),
            Err(err) => Err(err.into()),
        }
    }

    fn update(&mut self) -> usize {
        let mut count = self.session.update(false);

        while let Some(event) = self.session.next_watch_event() {
            count += 1;
            let name = match event.event_type {
                EventType::Child | EventType::Created | EventType::Deleted => {
                    self.name_for(&event.path)
                }
                EventType::Changed => None,
            };
            match name.and_then(|name| self.names.get_mut(&name)) {
                Some(entry) => entry.dirty = true,
                None => trace!(path = %event.path, "watch event for untracked path"),
            }
        }

        let epoch = self.session.epoch();
        if epoch != self.seen_epoch {
            debug!(epoch, "coordination session (re)connected, relisting names");
            self.seen_epoch = epoch;
            for entry in self.names.values_mut() {
                entry.dirty = true;
            }
        }

        let root = self.root.clone();
        for (name, entry) in self.names.iter_mut() {
            let path = join_path(&root, name);
            if let Some(urls) = advance(&mut self.session, &path, entry) {
                count += 1;
                let urls = normalize_urls(urls);
                if urls != entry.urls {
                    debug!(%name, ?urls, "service address set changed");
                    entry.urls = urls.clone();
                    self.changes.push(NameChange {
                        name: name.clone(),
                        urls,
                    });
                }
            }
        }
        count
    }

    fn take_changes(&mut self) -> Vec<NameChange> {
        mem::take(&mut self.changes)
    }
}

/// Builds [`CoordinationNaming`] resolvers, each with its own session.
#[derive(Debug, Clone)]
pub struct CoordinationNamingFactory {
    connector: Arc<dyn Connector>,
}

impl CoordinationNamingFactory {
    /// Factory opening sessions through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

impl NamingFactory for CoordinationNamingFactory {
    fn create(&self, config: &NamingConfig) -> NamingResult<Box<dyn Naming>> {
        let session = CoordinationSession::new(config.session.clone(), self.connector.clone());
        Ok(Box::new(CoordinationNaming::new(session, &config.root)?))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coordination::{MemoryEnsemble, SessionConfig};

    use super::*;

    fn naming(ensemble: &MemoryEnsemble) -> CoordinationNaming {
        let config = SessionConfig::new("mem:2181")
            .with_timeout(Duration::from_secs(2))
            .with_reconnect(Duration::ZERO, Duration::ZERO);
        let session = CoordinationSession::new(config, Arc::new(ensemble.clone()));
        CoordinationNaming::new(session, "/services").unwrap()
    }

    fn settle(naming: &mut CoordinationNaming) -> Vec<NameChange> {
        let mut changes = Vec::new();
        for _ in 0..20 {
            naming.update();
            changes.extend(naming.take_changes());
        }
        changes
    }

    #[test]
    fn test_name_for_path() {
        let ensemble = MemoryEnsemble::new();
        let mut n = naming(&ensemble);
        n.watch_name("team/echo").unwrap();
        assert_eq!(n.name_for("/services/team/echo"), Some("team/echo".into()));
        assert_eq!(n.name_for("/services/other"), None);
        assert_eq!(n.name_for("/servicesx/team/echo"), None);
    }

    #[test]
    fn test_watch_reports_and_tracks_changes() {
        let ensemble = MemoryEnsemble::new();
        ensemble.ensure_path("/services/echo").unwrap();
        ensemble.create_node("/services/echo/x", b"mem://x").unwrap();
        let mut n = naming(&ensemble);
        n.watch_name("echo").unwrap();

        let changes = settle(&mut n);
        assert_eq!(
            changes,
            vec![NameChange {
                name: "echo".into(),
                urls: vec!["mem://x".into()],
            }]
        );
        assert_eq!(n.get_urls("echo"), Some(&["mem://x".to_owned()][..]));

        ensemble.create_node("/services/echo/y", b"mem://y").unwrap();
        let changes = settle(&mut n);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].urls, vec!["mem://x".to_owned(), "mem://y".to_owned()]);

        // nothing moved: nothing reported
        assert!(settle(&mut n).is_empty());
    }

    #[test]
    fn test_missing_name_node_is_empty_until_created() {
        let ensemble = MemoryEnsemble::new();
        let mut n = naming(&ensemble);
        n.watch_name("late").unwrap();
        assert!(settle(&mut n).is_empty());
        assert_eq!(n.get_urls("late"), Some(&[][..]));

        ensemble.ensure_path("/services/late").unwrap();
        ensemble.create_node("/services/late/a", b"mem://a").unwrap();
        let changes = settle(&mut n);
        assert_eq!(changes.last().map(|c| c.urls.clone()), Some(vec!["mem://a".to_owned()]));
    }

    #[test]
    fn test_connection_loss_keeps_last_set() {
        let ensemble = MemoryEnsemble::new();
        ensemble.ensure_path("/services/echo").unwrap();
        ensemble.create_node("/services/echo/x", b"mem://x").unwrap();
        let mut n = naming(&ensemble);
        n.watch_name("echo").unwrap();
        assert_eq!(settle(&mut n).len(), 1);

        // the relist is in flight when the connection drops
        ensemble.create_node("/services/echo/y", b"mem://y").unwrap();
        n.update();
        let id = n.session().session_id().unwrap();
        assert!(ensemble.disconnect_session(id));
        for _ in 0..3 {
            n.update();
        }
        assert!(n.take_changes().is_empty());
        assert_eq!(n.get_urls("echo"), Some(&["mem://x".to_owned()][..]));

        assert!(ensemble.reconnect_session(id));
        assert_eq!(
            settle(&mut n),
            vec![NameChange {
                name: "echo".into(),
                urls: vec!["mem://x".into(), "mem://y".into()],
            }]
        );
    }

    #[test]
    fn test_register_and_resolve() {
        let ensemble = MemoryEnsemble::new();
        let mut n = naming(&ensemble);
        n.register("echo", "mem://self", "i-1").unwrap();
        assert!(ensemble.exists("/services/echo/i-1"));
        assert_eq!(n.resolve_blocking("echo").unwrap(), vec!["mem://self".to_owned()]);
        assert_eq!(n.resolve_blocking("none").unwrap(), Vec::<String>::new());
        n.unregister("echo", "i-1").unwrap();
        assert!(!ensemble.exists("/services/echo/i-1"));
        assert!(matches!(
            n.unregister("echo", "i-1"),
            Err(NamingError::NotFound(_))
        ));
    }
}
