//! Outstanding RPC calls.
//!
//! A call is opened against a handle with a deadline and answered by a
//! processor through [`CallRegistry::complete`]. Requests are not written
//! directly: they queue in an outbox that the driver flushes to the
//! transport during its I/O step, so tasks never need the transport.
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::channel::oneshot;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    metrics,
    transport::{Handle, TransportError},
};

/// Key of an outstanding call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Errors returned by the call registry and delivered to callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// no reply within the call timeout
    #[error("{0} timed out")]
    Timeout(CallId),
    /// the peer closed the handle the call was made on
    #[error("peer closed {0}")]
    PeerClosed(Handle),
    /// the request could not be written
    #[error("send failed: {0}")]
    Send(#[from] TransportError),
    /// an id that is still outstanding was reused
    #[error("{0} is already outstanding")]
    Duplicate(CallId),
    /// the id is not outstanding
    #[error("unknown {0}")]
    Unknown(CallId),
    /// the registry went away before answering
    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    /// Returns true if trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Timeout(_) | CallError::PeerClosed(_) | CallError::Send(_)
        )
    }
}

/// Shorthand result alias for calls.
pub type CallResult<T> = Result<T, CallError>;

struct CallSlot {
    handle: Handle,
    deadline: Instant,
    tx: oneshot::Sender<CallResult<Bytes>>,
}

/// A request waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// destination
    pub handle: Handle,
    /// bytes to write
    pub payload: Bytes,
    /// call to fail if the write fails
    pub call: Option<CallId>,
}

#[derive(Default)]
struct CallsInner {
    next_id: u64,
    calls: BTreeMap<CallId, CallSlot>,
    outbox: VecDeque<Outgoing>,
}

/// Shared call registry. Cheap to clone; not `Send`.
#[derive(Clone)]
pub struct CallRegistry {
    inner: Rc<RefCell<CallsInner>>,
    default_timeout: Duration,
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry")
            .field("outstanding", &self.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl CallRegistry {
    /// Make an empty registry; [`call`](CallRegistry::call) uses
    /// `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CallsInner::default())),
            default_timeout,
        }
    }

    /// timeout used by [`call`](CallRegistry::call)
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a call on `handle` that fails after `timeout`.
    pub fn open(&self, handle: Handle, timeout: Duration) -> (CallId, Reply) {
        let mut inner = self.inner.borrow_mut();
        // skip ids still held by open_with_id
        let id = loop {
            inner.next_id += 1;
            let id = CallId(inner.next_id);
            if !inner.calls.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(
            id,
            CallSlot {
                handle,
                deadline: Instant::now() + timeout,
                tx,
            },
        );
        trace!(%id, %handle, "call opened");
        (id, Reply { rx })
    }

    /// Register a call under a caller-chosen id. Reusing an outstanding id is
    /// an error.
    pub fn open_with_id(&self, id: CallId, handle: Handle, timeout: Duration) -> CallResult<Reply> {
        let mut inner = self.inner.borrow_mut();
        if inner.calls.contains_key(&id) {
            return Err(CallError::Duplicate(id));
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(
            id,
            CallSlot {
                handle,
                deadline: Instant::now() + timeout,
                tx,
            },
        );
        Ok(Reply { rx })
    }

    /// Open a call with the default timeout and queue `payload` for
    /// `handle`. `encode` builds the request from the new call id.
    pub fn call(&self, handle: Handle, encode: impl FnOnce(CallId) -> Bytes) -> (CallId, Reply) {
        let (id, reply) = self.open(handle, self.default_timeout);
        let payload = encode(id);
        self.inner.borrow_mut().outbox.push_back(Outgoing {
            handle,
            payload,
            call: Some(id),
        });
        (id, reply)
    }

    /// Queue a one-way message.
    pub fn send(&self, handle: Handle, payload: Bytes) {
        self.inner.borrow_mut().outbox.push_back(Outgoing {
            handle,
            payload,
            call: None,
        });
    }

    /// Drain queued writes.
    pub fn take_outbox(&self) -> Vec<Outgoing> {
        self.inner.borrow_mut().outbox.drain(..).collect()
    }

    /// Answer a call.
    pub fn complete(&self, id: CallId, payload: Bytes) -> CallResult<()> {
        self.finish(id, Ok(payload))
    }

    /// Fail a call.
    pub fn fail(&self, id: CallId, err: CallError) -> CallResult<()> {
        self.finish(id, Err(err))
    }

    fn finish(&self, id: CallId, result: CallResult<Bytes>) -> CallResult<()> {
        let slot = self.inner.borrow_mut().calls.remove(&id);
        match slot {
            // the caller may have dropped its reply
            Some(slot) => {
                let _ = slot.tx.send(result);
                Ok(())
            }
            None => Err(CallError::Unknown(id)),
        }
    }

    /// Fail every call made on `handle`. Returns how many were failed.
    pub fn fail_handle(&self, handle: Handle) -> usize {
        let failed: Vec<CallSlot> = {
            let mut inner = self.inner.borrow_mut();
            let ids: Vec<CallId> = inner
                .calls
                .iter()
                .filter(|(_, slot)| slot.handle == handle)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| inner.calls.remove(id))
                .collect()
        };
        let count = failed.len();
        for slot in failed {
            let _ = slot.tx.send(Err(CallError::PeerClosed(handle)));
        }
        if count > 0 {
            debug!(%handle, count, "calls failed by closed handle");
        }
        count
    }

    /// Fail every call whose deadline passed at `now`. Returns how many.
    pub fn scan_timeouts(&self, now: Instant) -> usize {
        let expired: Vec<(CallId, CallSlot)> = {
            let mut inner = self.inner.borrow_mut();
            let ids: Vec<CallId> = inner
                .calls
                .iter()
                .filter(|(_, slot)| slot.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.calls.remove(&id).map(|slot| (id, slot)))
                .collect()
        };
        let count = expired.len();
        for (id, slot) in expired {
            debug!(%id, handle = %slot.handle, "call timed out");
            metrics::CALL_TIMEOUTS.inc();
            let _ = slot.tx.send(Err(CallError::Timeout(id)));
        }
        count
    }

    /// count of outstanding calls
    pub fn len(&self) -> usize {
        self.inner.borrow().calls.len()
    }

    /// Returns true if no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Future resolving to a call's reply
#[derive(Debug)]
pub struct Reply {
    rx: oneshot::Receiver<CallResult<Bytes>>,
}

impl Future for Reply {
    type Output = CallResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CallError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[test]
    fn test_complete_and_unknown() {
        let calls = CallRegistry::new(Duration::from_secs(1));
        let (id, reply) = calls.open(Handle(1), Duration::from_secs(1));
        calls.complete(id, Bytes::from_static(b"ok")).unwrap();
        assert_eq!(reply.now_or_never(), Some(Ok(Bytes::from_static(b"ok"))));
        assert_eq!(calls.complete(id, Bytes::new()), Err(CallError::Unknown(id)));
        assert!(calls.is_empty());
    }

    #[test]
    fn test_timeout_scan() {
        let calls = CallRegistry::new(Duration::from_secs(1));
        let (late, late_reply) = calls.open(Handle(1), Duration::ZERO);
        let (_, mut live_reply) = calls.open(Handle(1), Duration::from_secs(60));
        assert_eq!(calls.scan_timeouts(Instant::now()), 1);
        assert_eq!(late_reply.now_or_never(), Some(Err(CallError::Timeout(late))));
        assert_eq!((&mut live_reply).now_or_never(), None);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn test_duplicate_id_and_handle_failure() {
        let calls = CallRegistry::new(Duration::from_secs(1));
        let reply = calls
            .open_with_id(CallId(7), Handle(2), Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            calls
                .open_with_id(CallId(7), Handle(2), Duration::from_secs(1))
                .unwrap_err(),
            CallError::Duplicate(CallId(7))
        );
        assert_eq!(calls.fail_handle(Handle(3)), 0);
        assert_eq!(calls.fail_handle(Handle(2)), 1);
        assert_eq!(
            reply.now_or_never(),
            Some(Err(CallError::PeerClosed(Handle(2))))
        );
    }

    #[test]
    fn test_call_queues_request() {
        let calls = CallRegistry::new(Duration::from_secs(1));
        let (id, _reply) = calls.call(Handle(4), |id| Bytes::from(id.0.to_be_bytes().to_vec()));
        calls.send(Handle(4), Bytes::from_static(b"oneway"));
        let outbox = calls.take_outbox();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].call, Some(id));
        assert_eq!(outbox[1].call, None);
        assert!(calls.take_outbox().is_empty());
    }
}
