#![allow(missing_docs)]

//! session lifecycle counters
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

lazy_static! {
    /// sessions expired by the server
    pub static ref SESSION_EXPIRED: IntCounter = register_int_counter!(
        "coordination_session_expired",
        "coordination sessions expired by the server"
    )
    .unwrap();

    /// successful reconnects that followed an expiry
    pub static ref SESSION_RECOVERED: IntCounter = register_int_counter!(
        "coordination_session_recovered",
        "coordination sessions recovered after expiry"
    )
    .unwrap();

    /// failed connect attempts, split by error
    pub static ref CONNECT_FAILED: IntCounterVec = register_int_counter_vec!(
        "coordination_connect_failed",
        "failed coordination connect attempts",
        &["error"]
    )
    .unwrap();

    pub static ref STATE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "coordination_state_transitions",
        "coordination session state transitions",
        &["state"]
    )
    .unwrap();

    /// ephemeral nodes recreated by replay
    pub static ref EPHEMERALS_RECREATED: IntCounter = register_int_counter!(
        "coordination_ephemerals_recreated",
        "ephemeral nodes recreated after reconnect"
    )
    .unwrap();
}
