#![allow(missing_docs)]

//! # metrics
//!
//! driver counters and gauges, registered in the default prometheus registry
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntGauge, IntGaugeVec, register_histogram, register_int_counter,
    register_int_gauge, register_int_gauge_vec,
};

lazy_static! {
    /// When the driver started
    pub static ref START_TIME: Instant = Instant::now();

    /// driver ticks run
    pub static ref TICKS: IntCounter = register_int_counter!("driver_ticks", "driver ticks run").unwrap();

    /// wall-clock cost of one tick
    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "driver_tick_duration",
        "driver tick duration (seconds)",
        vec![0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1]
    )
    .unwrap();

    /// messages handed to a processor
    pub static ref DISPATCHED: IntCounter =
        register_int_counter!("dispatched_messages", "messages dispatched to a processor").unwrap();
    /// messages dropped because no processor was bound to the handle
    pub static ref UNBOUND_DISPATCH: IntCounter =
        register_int_counter!("unbound_dispatch", "messages dropped for a handle with no bound processor").unwrap();

    /// handles attached by a routing change
    pub static ref ROUTE_ATTACH: IntCounter =
        register_int_counter!("route_attach", "handles attached by routing changes").unwrap();
    /// handles detached by a routing change
    pub static ref ROUTE_DETACH: IntCounter =
        register_int_counter!("route_detach", "handles detached by routing changes").unwrap();

    pub static ref TIMERS_FIRED: IntCounter =
        register_int_counter!("timers_fired", "timer callbacks run").unwrap();
    pub static ref CALL_TIMEOUTS: IntCounter =
        register_int_counter!("call_timeouts", "calls failed by the timeout scan").unwrap();

    /// # of registered processors
    pub static ref PROCESSORS: IntGauge =
        register_int_gauge!("processors", "count of registered processors").unwrap();
    /// # of cached routers
    pub static ref ROUTES: IntGauge = register_int_gauge!("routes", "count of cached routers").unwrap();
    /// # of live cooperative tasks
    pub static ref TASKS: IntGauge = register_int_gauge!("tasks", "count of live cooperative tasks").unwrap();

    /// last value of each resource item at the end of a report window
    pub static ref RESOURCE_USAGE: IntGaugeVec = register_int_gauge_vec!(
        "resource_usage",
        "resource item value at the end of the last report window",
        &["name"]
    )
    .unwrap();
    /// largest value of each resource item within the last report window
    pub static ref RESOURCE_USAGE_MAX: IntGaugeVec = register_int_gauge_vec!(
        "resource_usage_max",
        "largest resource item value within the last report window",
        &["name"]
    )
    .unwrap();
}
