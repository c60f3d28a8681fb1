use std::{sync::Arc, time::Duration};

use anyhow::Result;
use coordination::{
    Acl, CoordinationSession, CreateMode, EventType, MemoryEnsemble, SessionConfig, SessionState,
    WatchKind, WatchedEvent, ZkError, digest_id, models::perms,
};
use tracing_test::traced_test;

fn config() -> SessionConfig {
    SessionConfig::new("zk1:2181,zk2:2181")
        .with_timeout(Duration::from_secs(2))
        .with_reconnect(Duration::ZERO, Duration::ZERO)
}

fn connected(ensemble: &MemoryEnsemble) -> Result<CoordinationSession> {
    let mut session = CoordinationSession::new(config(), Arc::new(ensemble.clone()));
    session.connect_blocking()?;
    Ok(session)
}

/// pump the session until it is connected on a handle other than `old`
fn recover(session: &mut CoordinationSession, old: i64) {
    for _ in 0..100 {
        session.update(true);
        if session.state() == SessionState::Connected
            && session.session_id().is_some_and(|id| id != old)
        {
            // collect the replay replies
            while session.update(false) > 0 {}
            return;
        }
    }
    panic!("session did not recover, state {}", session.state());
}

fn expire(ensemble: &MemoryEnsemble, session: &mut CoordinationSession) -> i64 {
    let old = session.session_id().expect("live session");
    assert!(ensemble.expire_session(old));
    recover(session, old);
    session.session_id().expect("recovered session")
}

#[test]
#[traced_test]
fn test_watches_rearmed_after_expiry() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    ensemble.create_node("/a", b"1")?;
    ensemble.create_node("/b", b"")?;
    let mut s = connected(&ensemble)?;

    s.get("/a", true)?;
    s.get_children("/b", true)?;
    assert_eq!(s.exists("/c", true)?, None);

    // fire /a once before the expiry
    ensemble.set_data("/a", b"2")?;
    s.update(false);
    assert_eq!(
        s.next_watch_event(),
        Some(WatchedEvent::new(EventType::Changed, "/a"))
    );

    let epoch = s.epoch();
    let id = expire(&ensemble, &mut s);
    assert_eq!(s.epoch(), epoch + 1);
    assert!(ensemble.has_watch(id, WatchKind::Data, "/a"));
    assert!(ensemble.has_watch(id, WatchKind::Child, "/b"));
    assert!(ensemble.has_watch(id, WatchKind::Exists, "/c"));
    assert_eq!(s.watched(WatchKind::Data), vec!["/a".to_owned()]);

    ensemble.set_data("/a", b"3")?;
    ensemble.create_node("/b/x", b"")?;
    ensemble.create_node("/c", b"")?;
    s.update(false);
    let mut events = Vec::new();
    while let Some(ev) = s.next_watch_event() {
        events.push(ev);
    }
    assert_eq!(
        events,
        vec![
            WatchedEvent::new(EventType::Changed, "/a"),
            WatchedEvent::new(EventType::Child, "/b"),
            WatchedEvent::new(EventType::Created, "/c"),
        ]
    );
    Ok(())
}

#[test]
fn test_data_watch_on_missing_node_waits_for_creation() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let mut s = connected(&ensemble)?;
    assert_eq!(s.get("/late", true), Err(ZkError::NoNode));
    // the reply queued an exists watch, sent before the update returned
    s.update(false);
    let id = s.session_id().expect("live session");
    assert!(ensemble.has_watch(id, WatchKind::Exists, "/late"));

    let id = expire(&ensemble, &mut s);
    assert!(ensemble.has_watch(id, WatchKind::Exists, "/late"));
    ensemble.create_node("/late", b"x")?;
    s.update(false);
    assert_eq!(
        s.next_watch_event(),
        Some(WatchedEvent::new(EventType::Created, "/late"))
    );
    Ok(())
}

#[test]
#[traced_test]
fn test_ephemeral_recreated_with_value_and_acl() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let mut s = connected(&ensemble)?;
    s.add_digest_auth("app:secret")?;
    s.create("/svc", b"", &Acl::open_unsafe(), CreateMode::Persistent)?;
    s.create(
        "/svc/a",
        b"1.2.3.4:9000",
        &Acl::creator_all(),
        CreateMode::Ephemeral,
    )?;
    let before = ensemble.node("/svc/a").expect("created");
    // later writes are not replayed, the creation value is
    s.set("/svc/a", b"changed", -1)?;

    let id = expire(&ensemble, &mut s);
    let after = ensemble.node("/svc/a").expect("recreated");
    assert_eq!(after.data, b"1.2.3.4:9000");
    assert_eq!(after.acl, before.acl);
    let expected = Acl::digest(perms::ALL, digest_id("app:secret")?);
    assert_eq!(after.acl, vec![expected]);
    assert_eq!(after.stat.ephemeral_owner, id);
    assert_eq!(s.ephemeral_nodes().len(), 1);
    Ok(())
}

#[test]
fn test_recreating_existing_ephemeral_is_success() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    ensemble.create_node("/svc", b"")?;
    let mut s = connected(&ensemble)?;
    s.create("/svc/a", b"v", &Acl::open_unsafe(), CreateMode::Ephemeral)?;

    // a suspended session keeps its node; resuming replays into NodeExists
    let id = s.session_id().expect("live session");
    assert!(ensemble.disconnect_session(id));
    s.update(false);
    assert_eq!(s.state(), SessionState::Suspended);
    assert!(ensemble.reconnect_session(id));
    s.update(false);
    assert_eq!(s.state(), SessionState::Connected);
    assert_eq!(s.session_id(), Some(id));
    assert_eq!(s.ephemeral_nodes().len(), 1);
    assert_eq!(ensemble.node("/svc/a").expect("kept").stat.ephemeral_owner, id);

    // something else recreated the node before the replay got there
    let old = s.session_id().expect("live session");
    assert!(ensemble.expire_session(old));
    ensemble.create_node("/svc/a", b"other")?;
    recover(&mut s, old);
    assert_eq!(ensemble.node("/svc/a").expect("present").data, b"other");
    assert_eq!(s.ephemeral_nodes().len(), 1);
    Ok(())
}

#[test]
fn test_credentials_replayed_in_order() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let mut s = connected(&ensemble)?;
    for credential in ["a:1", "b:2", "c:3"] {
        s.add_digest_auth(credential)?;
    }
    let id = expire(&ensemble, &mut s);
    assert_eq!(
        ensemble.session_credentials(id),
        vec!["a:1".to_owned(), "b:2".to_owned(), "c:3".to_owned()]
    );
    assert_eq!(ensemble.session_auths(id).len(), 3);
    assert_eq!(s.credentials(), ["a:1", "b:2", "c:3"].map(str::to_owned));
    Ok(())
}

#[test]
#[traced_test]
fn test_service_node_and_child_watch_survive_expiry() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    ensemble.ensure_path("/svc")?;
    let mut s = connected(&ensemble)?;
    s.create(
        "/svc/a",
        b"1.2.3.4:9000",
        &Acl::open_unsafe(),
        CreateMode::Ephemeral,
    )?;
    assert_eq!(s.get_children("/svc", true)?, vec!["a".to_owned()]);

    expire(&ensemble, &mut s);
    assert_eq!(
        ensemble.node("/svc/a").expect("recreated").data,
        b"1.2.3.4:9000"
    );
    assert_eq!(s.next_watch_event(), None);

    ensemble.create_node("/svc/b", b"5.6.7.8:9000")?;
    s.update(false);
    assert_eq!(
        s.next_watch_event(),
        Some(WatchedEvent::new(EventType::Child, "/svc"))
    );
    Ok(())
}

#[test]
fn test_call_in_flight_during_expiry_fails_once() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let mut s = connected(&ensemble)?;
    let old = s.session_id().expect("live session");
    assert!(ensemble.expire_session(old));

    let mut pending = s.aexists("/", false);
    assert_eq!(pending.try_take(), Some(Err(ZkError::SessionExpired)));
    recover(&mut s, old);
    assert!(s.exists("/", false)?.is_some());
    Ok(())
}

#[test]
fn test_dns_failure_is_distinct() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    ensemble.set_dns_failure(true);
    let mut s = CoordinationSession::new(config(), Arc::new(ensemble.clone()));
    assert_eq!(s.connect_blocking(), Err(ZkError::DnsFailure));
    assert_eq!(s.state(), SessionState::Connecting);
    assert_eq!(s.get("/", false), Err(ZkError::ConnectionLoss));

    ensemble.set_dns_failure(false);
    s.connect_blocking()?;
    assert_eq!(s.state(), SessionState::Connected);

    // recovery keeps retrying while names do not resolve
    s.create("/e", b"", &Acl::open_unsafe(), CreateMode::Ephemeral)?;
    let old = s.session_id().expect("live session");
    ensemble.set_dns_failure(true);
    assert!(ensemble.expire_session(old));
    s.update(false);
    assert_eq!(s.state(), SessionState::Connecting);
    assert_eq!(s.session_id(), None);
    s.update(false);
    assert_eq!(s.session_id(), None);

    ensemble.set_dns_failure(false);
    recover(&mut s, old);
    assert!(ensemble.exists("/e"));
    Ok(())
}

#[test]
fn test_close_clean_deletes_ephemerals() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let mut s = connected(&ensemble)?;
    s.create("/keep", b"", &Acl::open_unsafe(), CreateMode::Persistent)?;
    s.create("/keep/e", b"", &Acl::open_unsafe(), CreateMode::Ephemeral)?;
    s.get("/keep", true)?;

    s.close(true);
    assert_eq!(s.state(), SessionState::Closed);
    assert!(!ensemble.exists("/keep/e"));
    assert!(ensemble.exists("/keep"));
    assert!(s.ephemeral_nodes().is_empty());
    assert!(s.watched(WatchKind::Data).is_empty());
    assert_eq!(s.get("/keep", false), Err(ZkError::Closing));
    assert_eq!(s.connect_blocking(), Err(ZkError::Closing));
    assert_eq!(s.update(false), 0);
    Ok(())
}
