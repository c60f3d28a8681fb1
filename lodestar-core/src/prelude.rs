//! lodestar prelude

pub use crate::{
    anyhow::{self, Context, Result},
    bytes::Bytes,
    driver::{
        Driver, DriverConfig, DriverHandle,
        calls::{CallError, CallId, CallRegistry},
        dispatch::DispatchError,
        routing::{Router, RouterType, RoutingError},
        tasks::TaskId,
        timer::{TimerAction, TimerHandle, TimerId},
    },
    naming::{Naming, NamingType},
    processor::{MessageFlags, Processor, ProcessorContext, ProcessorId},
    tracing::{self, debug, error, info, instrument, trace, warn},
    transport::{Handle, MessageInfo, Transport, TransportError},
};

pub use std::{collections::HashMap, rc::Rc, time::Duration};
