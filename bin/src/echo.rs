use std::collections::HashMap;

use lodestar_core::{
    bytes::{BufMut, Bytes, BytesMut},
    prelude::*,
};

/// `call id (8 bytes, big endian) | body`
pub fn encode(id: CallId, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u64(id.0);
    buf.put_slice(body);
    buf.freeze()
}

/// Split a reply into its call id and body.
pub fn decode(payload: &Bytes) -> Option<(CallId, Bytes)> {
    let id: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some((CallId(u64::from_be_bytes(id)), payload.slice(8..)))
}

/// Answers outstanding calls from replies on routed handles and logs
/// everything else.
#[derive(Debug, Default)]
pub struct EchoProcessor {
    replies: i64,
    stray: i64,
}

impl Processor for EchoProcessor {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_message(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        remote: Handle,
        payload: Bytes,
        info: &MessageInfo,
        flags: MessageFlags,
    ) {
        if flags.contains(MessageFlags::FIRST) {
            debug!(%remote, "first message on handle");
        }
        match decode(&payload) {
            Some((id, body)) if ctx.calls.complete(id, body.clone()).is_ok() => {
                self.replies += 1;
            }
            _ => {
                self.stray += 1;
                debug!(%remote, seq = info.seq, len = info.len, "message with no outstanding call");
            }
        }
    }

    fn resource_used(&self) -> HashMap<String, i64> {
        HashMap::from([
            ("replies".to_owned(), self.replies),
            ("stray".to_owned(), self.stray),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let payload = encode(CallId(7), b"ping");
        assert_eq!(
            decode(&payload),
            Some((CallId(7), Bytes::from_static(b"ping")))
        );
        assert_eq!(decode(&Bytes::from_static(b"short")), None);
    }
}
