//! Transport collaborator: the driver only opens, closes, sends on and polls
//! opaque connection handles. Payload bytes are never parsed here.
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::Arc,
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

/// Opaque connection token, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata the transport attaches to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// when the transport read it
    pub received_at: Instant,
    /// payload length
    pub len: usize,
    /// per-transport receive counter
    pub seq: u64,
}

/// What [`Transport::poll`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// a message arrived on `handle`
    Message {
        /// receiving connection
        handle: Handle,
        /// raw bytes, handed to the processor untouched
        payload: Bytes,
        /// receive metadata
        info: MessageInfo,
    },
    /// the connection behind `handle` is up
    PeerConnected(Handle),
    /// the remote side went away
    PeerClosed(Handle),
    /// we closed `handle`
    Closed(Handle),
}

/// Errors returned by transports
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// url is not something this transport can open
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// peer refused the connection
    #[error("connection refused: {0}")]
    Refused(String),
    /// handle is not open
    #[error("unknown handle {0}")]
    UnknownHandle(Handle),
}

/// Shorthand result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Pluggable message transport. Every method is non-blocking.
pub trait Transport: fmt::Debug {
    /// Open a connection to `url`.
    fn connect(&mut self, url: &str) -> TransportResult<Handle>;

    /// Close `handle`. A [`TransportEvent::Closed`] follows on a later poll.
    fn close(&mut self, handle: Handle) -> TransportResult<()>;

    /// Queue `payload` on `handle`.
    fn send(&mut self, handle: Handle, payload: Bytes) -> TransportResult<()>;

    /// Queue several buffers as one message.
    fn send_vectored(&mut self, handle: Handle, parts: &[Bytes]) -> TransportResult<()> {
        let mut buf = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in parts {
            buf.extend_from_slice(part);
        }
        self.send(handle, buf.freeze())
    }

    /// Take at most `max` pending events.
    fn poll(&mut self, max: usize) -> Vec<TransportEvent>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_handle: u64,
    next_seq: u64,
    open: BTreeMap<Handle, String>,
    refused: BTreeSet<String>,
    events: VecDeque<TransportEvent>,
    sent: Vec<(Handle, Bytes)>,
    echo: bool,
}

impl MemoryInner {
    fn push_message(&mut self, handle: Handle, payload: Bytes) {
        self.next_seq += 1;
        let info = MessageInfo {
            received_at: Instant::now(),
            len: payload.len(),
            seq: self.next_seq,
        };
        self.events.push_back(TransportEvent::Message {
            handle,
            payload,
            info,
        });
    }
}

/// Loopback transport with scripted peers. Clones share state, so a test can
/// keep one clone to inject traffic while the driver owns another.
///
/// Urls are `scheme://rest`; anything without `://` is rejected.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    /// Make an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every send is delivered back on the same handle.
    pub fn set_echo(&self, echo: bool) {
        self.inner.lock().echo = echo;
    }

    /// Refuse (or stop refusing) connections to `url`.
    pub fn refuse(&self, url: &str, refuse: bool) {
        let mut inner = self.inner.lock();
        if refuse {
            inner.refused.insert(url.to_owned());
        } else {
            inner.refused.remove(url);
        }
    }

    /// Script an inbound message on `handle`.
    pub fn inject(&self, handle: Handle, payload: impl Into<Bytes>) {
        self.inner.lock().push_message(handle, payload.into());
    }

    /// Script the remote side closing `handle`.
    pub fn peer_close(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        if inner.open.remove(&handle).is_some() {
            inner.events.push_back(TransportEvent::PeerClosed(handle));
        }
    }

    /// Handle currently open to `url`, if any.
    pub fn handle_for(&self, url: &str) -> Option<Handle> {
        self.inner
            .lock()
            .open
            .iter()
            .find_map(|(handle, open)| (open == url).then_some(*handle))
    }

    /// Url behind an open handle.
    pub fn url_of(&self, handle: Handle) -> Option<String> {
        self.inner.lock().open.get(&handle).cloned()
    }

    /// Returns true if `handle` is open.
    pub fn is_open(&self, handle: Handle) -> bool {
        self.inner.lock().open.contains_key(&handle)
    }

    /// count of open handles
    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<(Handle, Bytes)> {
        std::mem::take(&mut self.inner.lock().sent)
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, url: &str) -> TransportResult<Handle> {
        let mut inner = self.inner.lock();
        if !url.contains("://") {
            return Err(TransportError::InvalidUrl(url.to_owned()));
        }
        if inner.refused.contains(url) {
            return Err(TransportError::Refused(url.to_owned()));
        }
        inner.next_handle += 1;
        let handle = Handle(inner.next_handle);
        inner.open.insert(handle, url.to_owned());
        inner.events.push_back(TransportEvent::PeerConnected(handle));
        debug!(%handle, url, "memory transport connected");
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        match inner.open.remove(&handle) {
            Some(url) => {
                debug!(%handle, %url, "memory transport closed");
                inner.events.push_back(TransportEvent::Closed(handle));
                Ok(())
            }
            None => Err(TransportError::UnknownHandle(handle)),
        }
    }

    fn send(&mut self, handle: Handle, payload: Bytes) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        if !inner.open.contains_key(&handle) {
            return Err(TransportError::UnknownHandle(handle));
        }
        trace!(%handle, len = payload.len(), "memory transport send");
        if inner.echo {
            inner.push_message(handle, payload.clone());
        }
        inner.sent.push((handle, payload));
        Ok(())
    }

    fn poll(&mut self, max: usize) -> Vec<TransportEvent> {
        let mut inner = self.inner.lock();
        let n = max.min(inner.events.len());
        inner.events.drain(..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_send_close() {
        let mut transport = MemoryTransport::new();
        let probe = transport.clone();
        let h = transport.connect("mem://a").unwrap();
        assert_eq!(probe.handle_for("mem://a"), Some(h));
        assert_eq!(transport.poll(10), vec![TransportEvent::PeerConnected(h)]);

        transport
            .send_vectored(h, &[Bytes::from_static(b"he"), Bytes::from_static(b"llo")])
            .unwrap();
        assert_eq!(probe.take_sent(), vec![(h, Bytes::from_static(b"hello"))]);

        transport.close(h).unwrap();
        assert_eq!(transport.close(h), Err(TransportError::UnknownHandle(h)));
        assert_eq!(transport.send(h, Bytes::new()), Err(TransportError::UnknownHandle(h)));
        assert_eq!(transport.poll(10), vec![TransportEvent::Closed(h)]);
    }

    #[test]
    fn test_refused_and_invalid() {
        let mut transport = MemoryTransport::new();
        transport.refuse("mem://down", true);
        assert_eq!(
            transport.connect("mem://down"),
            Err(TransportError::Refused("mem://down".into()))
        );
        assert_eq!(
            transport.connect("nourl"),
            Err(TransportError::InvalidUrl("nourl".into()))
        );
        assert!(transport.poll(10).is_empty());
    }

    #[test]
    fn test_poll_is_bounded_and_echo() {
        let mut transport = MemoryTransport::new();
        let h = transport.connect("mem://a").unwrap();
        transport.set_echo(true);
        transport.send(h, Bytes::from_static(b"1")).unwrap();
        transport.send(h, Bytes::from_static(b"2")).unwrap();
        assert_eq!(transport.poll(2).len(), 2);
        let rest = transport.poll(10);
        assert!(matches!(
            &rest[..],
            [TransportEvent::Message { payload, info, .. }] if payload == "2" && info.seq == 2
        ));
    }
}
