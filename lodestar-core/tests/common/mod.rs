use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

use lodestar_core::{
    Driver, DriverConfig,
    bytes::{BufMut, Bytes, BytesMut},
    driver::calls::CallId,
    naming::NamingType,
    processor::{MessageFlags, Processor, ProcessorContext},
    transport::{Handle, MemoryTransport, MessageInfo},
};

/// A message as a processor saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub handle: Handle,
    pub payload: Bytes,
    pub flags: MessageFlags,
}

pub type Log = Rc<RefCell<Vec<Seen>>>;

/// Records every message. Payloads starting with an 8 byte id of an open
/// call complete that call with the rest of the payload.
#[derive(Debug)]
pub struct RecordingProcessor {
    name: String,
    log: Log,
}

impl RecordingProcessor {
    pub fn new(name: &str) -> (Self, Log) {
        let log = Log::default();
        (
            Self {
                name: name.to_owned(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl Processor for RecordingProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_message(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        remote: Handle,
        payload: Bytes,
        _info: &MessageInfo,
        flags: MessageFlags,
    ) {
        if payload.len() >= 8 {
            let mut id = [0; 8];
            id.copy_from_slice(&payload[..8]);
            let _ = ctx
                .calls
                .complete(CallId(u64::from_be_bytes(id)), payload.slice(8..));
        }
        self.log.borrow_mut().push(Seen {
            handle: remote,
            payload,
            flags,
        });
    }

    fn resource_used(&self) -> HashMap<String, i64> {
        HashMap::from([("seen".to_owned(), self.log.borrow().len() as i64)])
    }
}

/// call id followed by `body`
pub fn request(id: CallId, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u64(id.0);
    buf.put_slice(body);
    buf.freeze()
}

pub fn config(default_naming: NamingType) -> DriverConfig {
    DriverConfig {
        default_naming,
        call_timeout: Duration::from_millis(50),
        ..DriverConfig::default()
    }
}

/// a driver on a memory transport, plus a probe sharing its state
pub fn driver(default_naming: NamingType) -> (Driver, MemoryTransport) {
    driver_with(config(default_naming))
}

pub fn driver_with(config: DriverConfig) -> (Driver, MemoryTransport) {
    let transport = MemoryTransport::new();
    let probe = transport.clone();
    (Driver::new(config, Box::new(transport)), probe)
}

/// tick until nothing is left to do
pub fn settle(driver: &mut Driver) {
    for _ in 0..10 {
        if driver.update() == 0 {
            return;
        }
    }
}
