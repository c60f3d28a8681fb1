//! # Driver
//!
//! The single entry point the host calls in a loop. Every [`Driver::update`]
//! is one bounded, non-blocking pass, in this order:
//!
//! 0. jobs handed over from other threads through a [`DriverHandle`]
//! 1. transport I/O: queued writes go out, inbound messages are dispatched
//! 2. naming updates, folded into routing and then into the dispatch table
//! 3. processor maintenance, then ready tasks
//! 4. due timers (including the self-stats timer), then tasks they woke
//! 5. call timeouts
//! 6. statistics, recording the tick's own cost as `_loop`
//!
//! The return value is the number of events handled; 0 means the host may
//! sleep.
use std::{
    cell::Cell,
    fmt,
    future::Future,
    rc::Rc,
    time::{Duration, Instant},
};

use naming::{Naming, NamingConfig, NamingFactory, NamingRegistry, NamingResult, NamingType, StaticNamingFactory};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

pub mod calls;
pub mod dispatch;
pub mod routing;
pub mod stats;
pub mod tasks;
pub mod timer;

use crate::{
    config::cli::Config,
    metrics,
    processor::{Processor, ProcessorContext, ProcessorId},
    transport::{Handle, MessageInfo, Transport, TransportEvent, TransportResult},
};
use calls::{CallError, CallRegistry};
use dispatch::{DispatchResult, DispatchTable, ProcessorRegistry};
use routing::{HandleDiff, Router, RouterFactory, RouterType, RoutingResult, RoutingTable};
use stats::StatManager;
use tasks::{TaskId, TaskResult, TaskScheduler};
use timer::{TimerAction, TimerHandle, TimerId};

/// name of the resource item recording each tick's cost, in microseconds
pub const LOOP_ITEM: &str = "_loop";
/// name of the resource item recording the live task count
pub const COROUTINE_ITEM: &str = "_coroutine";

/// Driver settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// max transport events and hand-off jobs taken per tick
    pub poll_batch: usize,
    /// period of the self-stats timer
    pub stat_interval: Duration,
    /// ticks per statistics window
    pub stat_report_cycle: u32,
    /// default timeout of [`CallRegistry::call`]
    pub call_timeout: Duration,
    /// handed to naming factories
    pub naming: NamingConfig,
    /// naming type routers watch their names on
    pub default_naming: NamingType,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_batch: 256,
            stat_interval: Duration::from_secs(1),
            stat_report_cycle: 10,
            call_timeout: Duration::from_secs(3),
            naming: NamingConfig::default(),
            default_naming: NamingType::Coordination,
        }
    }
}

impl From<&Config> for DriverConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_batch: config.poll_batch,
            stat_interval: config.stat_interval(),
            stat_report_cycle: config.stat_report_cycle,
            call_timeout: config.call_timeout(),
            naming: config.naming_config(),
            default_naming: config.default_naming,
        }
    }
}

type Job = Box<dyn FnOnce(&mut Driver) + Send>;

/// The driver dropped its end of the hand-off queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("driver is gone")]
pub struct DriverGone;

/// `Send` handle for handing work to the driver from other threads. Jobs run
/// on the driver thread at the start of a later tick.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl DriverHandle {
    /// Queue `job` for the next tick.
    pub fn execute(&self, job: impl FnOnce(&mut Driver) + Send + 'static) -> Result<(), DriverGone> {
        self.tx.send(Box::new(job)).map_err(|_| DriverGone)
    }

    /// Returns true once the driver is dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Runtime core: owns the transport, processors, naming, routing, timers,
/// tasks and calls, and advances all of them one tick at a time.
pub struct Driver {
    config: DriverConfig,
    transport: Box<dyn Transport>,
    processors: ProcessorRegistry,
    dispatch: DispatchTable,
    naming: NamingRegistry,
    routing: RoutingTable,
    timer: TimerHandle,
    tasks: TaskScheduler,
    calls: CallRegistry,
    stats: StatManager,
    stats_due: Rc<Cell<bool>>,
    stat_timer: TimerId,
    handoff_tx: mpsc::UnboundedSender<Job>,
    handoff_rx: mpsc::UnboundedReceiver<Job>,
    last_info: Option<MessageInfo>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("processors", &self.processors.len())
            .field("dispatch", &self.dispatch.len())
            .field("routes", &self.routing.len())
            .field("tasks", &self.tasks.size())
            .finish()
    }
}

impl Driver {
    /// Make a driver over `transport`. A static naming factory is bound by
    /// default; other naming types need [`set_naming_factory`].
    ///
    /// [`set_naming_factory`]: Driver::set_naming_factory
    pub fn new(config: DriverConfig, transport: Box<dyn Transport>) -> Self {
        let mut naming = NamingRegistry::new(config.naming.clone());
        naming.set_factory(NamingType::Static, Box::new(StaticNamingFactory::new()));

        let timer = TimerHandle::new();
        let stats_due = Rc::new(Cell::new(false));
        let due = stats_due.clone();
        let interval = config.stat_interval;
        let stat_timer = timer.start_timer(interval, move || {
            due.set(true);
            TimerAction::Rearm(interval)
        });
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();

        Self {
            routing: RoutingTable::with_builtin_factories(config.default_naming),
            calls: CallRegistry::new(config.call_timeout),
            stats: StatManager::new(config.stat_report_cycle),
            config,
            transport,
            processors: ProcessorRegistry::new(),
            dispatch: DispatchTable::new(),
            naming,
            timer,
            tasks: TaskScheduler::new(),
            stats_due,
            stat_timer,
            handoff_tx,
            handoff_rx,
            last_info: None,
        }
    }

    /// driver settings
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run one pass. Returns how many events were handled.
    #[instrument(level = "debug", skip_all)]
    pub fn update(&mut self) -> usize {
        let start = Instant::now();
        let mut count = self.drain_handoff();
        count += self.pump_io();
        count += self.update_naming();

        count += self.processors.update_all();
        count += self.tasks.run();

        count += self.timer.advance(Instant::now());
        if self.stats_due.replace(false) {
            self.sample_self_stats();
        }
        count += self.tasks.run();

        count += self.calls.scan_timeouts(Instant::now());

        let elapsed = start.elapsed();
        self.stats
            .add_resource_item(LOOP_ITEM, elapsed.as_micros().min(i64::MAX as u128) as i64);
        self.stats.update();
        metrics::TICKS.inc();
        metrics::TICK_DURATION.observe(elapsed.as_secs_f64());
        count
    }

    /// Bootstrap helper: tick until `done` holds or `timeout` passes,
    /// sleeping briefly on idle ticks. Blocks the calling thread; never call
    /// it from a task. Returns whether `done` held.
    pub fn update_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&mut Driver) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if self.update() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn drain_handoff(&mut self) -> usize {
        let mut count = 0;
        while count < self.config.poll_batch {
            let Ok(job) = self.handoff_rx.try_recv() else {
                break;
            };
            job(self);
            count += 1;
        }
        count
    }

    #[instrument(level = "debug", skip_all)]
    fn pump_io(&mut self) -> usize {
        for out in self.calls.take_outbox() {
            if let Err(err) = self.transport.send(out.handle, out.payload) {
                warn!(handle = %out.handle, ?err, "send failed");
                if let Some(id) = out.call {
                    // already answered or timed out otherwise
                    let _ = self.calls.fail(id, CallError::Send(err));
                }
            }
        }

        let events = self.transport.poll(self.config.poll_batch);
        let count = events.len();
        for event in events {
            match event {
                TransportEvent::Message {
                    handle,
                    payload,
                    info,
                } => {
                    let mut ctx = ProcessorContext {
                        transport: self.transport.as_mut(),
                        calls: &self.calls,
                        timer: &self.timer,
                        spawner: self.tasks.spawner(),
                    };
                    // unbound messages are counted and logged by dispatch
                    let _ = self.dispatch.dispatch(
                        handle,
                        payload,
                        &info,
                        &mut self.processors,
                        &mut ctx,
                    );
                    self.last_info = Some(info);
                }
                TransportEvent::PeerConnected(handle) => trace!(%handle, "peer connected"),
                TransportEvent::PeerClosed(handle) => {
                    debug!(%handle, "peer closed");
                    self.calls.fail_handle(handle);
                }
                TransportEvent::Closed(handle) => {
                    trace!(%handle, "handle closed");
                    self.calls.fail_handle(handle);
                }
            }
        }
        count
    }

    #[instrument(level = "debug", skip_all)]
    fn update_naming(&mut self) -> usize {
        let mut count = self.naming.update();
        for (naming_type, change) in self.naming.take_changes() {
            count += 1;
            self.routing
                .apply_change(naming_type, &change, self.transport.as_mut());
        }
        count + self.apply_route_diffs()
    }

    fn apply_route_diffs(&mut self) -> usize {
        self.routing
            .take_diffs()
            .into_iter()
            .map(|route| {
                self.dispatch
                    .apply_route_diff(&route.name, &route.diff, &self.processors)
            })
            .sum()
    }

    fn sample_self_stats(&mut self) {
        self.stats
            .add_resource_item(COROUTINE_ITEM, self.tasks.size() as i64);
        for (name, value) in self.processors.resource_used() {
            self.stats.add_resource_item(&name, value);
        }
    }

    // -----------------------------------------------------------------------
    // processors and bindings
    // -----------------------------------------------------------------------

    /// Take ownership of `processor`.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) -> ProcessorId {
        self.processors.add(processor)
    }

    /// Remove `id`, detaching every handle and router bound to it.
    pub fn remove_processor(&mut self, id: ProcessorId) -> Option<Box<dyn Processor>> {
        let processor = self.processors.remove(id)?;
        let handles = self.dispatch.detach_processor(id);
        debug!(%id, handles = handles.len(), "processor removed");
        Some(processor)
    }

    /// registered processors
    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    /// Bind `handle` to `processor` (last write wins).
    pub fn attach(
        &mut self,
        handle: Handle,
        processor: ProcessorId,
    ) -> DispatchResult<Option<ProcessorId>> {
        self.dispatch.attach(handle, processor, &self.processors)
    }

    /// Remove the binding of `handle`.
    pub fn detach(&mut self, handle: Handle) -> DispatchResult<ProcessorId> {
        self.dispatch.detach(handle)
    }

    /// Follow router `name` with `processor`: its current handles are
    /// attached now, later changes are applied as they happen. Returns how
    /// many handles were attached now.
    pub fn attach_router(&mut self, name: &str, processor: ProcessorId) -> DispatchResult<usize> {
        self.dispatch
            .attach_router(name, processor, &self.processors)?;
        let current = self
            .routing
            .last_handles(name)
            .map(<[Handle]>::to_vec)
            .unwrap_or_default();
        let diff = HandleDiff {
            detached: Vec::new(),
            attached: current,
        };
        Ok(self
            .dispatch
            .apply_route_diff(name, &diff, &self.processors))
    }

    /// the dispatch table
    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    // -----------------------------------------------------------------------
    // transport
    // -----------------------------------------------------------------------

    /// Open a connection to `url`; failures are logged and returned.
    pub fn connect(&mut self, url: &str) -> TransportResult<Handle> {
        self.transport.connect(url).inspect_err(|err| {
            warn!(url, ?err, "connect failed");
        })
    }

    /// Close `handle`; failures are logged and returned.
    pub fn close(&mut self, handle: Handle) -> TransportResult<()> {
        self.transport.close(handle).inspect_err(|err| {
            warn!(%handle, ?err, "close failed");
        })
    }

    /// the transport
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Metadata of the last dispatched or dropped message.
    pub fn last_message_info(&self) -> Option<&MessageInfo> {
        self.last_info.as_ref()
    }

    // -----------------------------------------------------------------------
    // naming and routing
    // -----------------------------------------------------------------------

    /// Bind the naming factory for `ty`.
    pub fn set_naming_factory(&mut self, ty: NamingType, factory: Box<dyn NamingFactory>) {
        self.naming.set_factory(ty, factory);
    }

    /// The cached resolver for `ty`, built on first request.
    pub fn get_naming(&mut self, ty: NamingType) -> NamingResult<&mut dyn Naming> {
        self.naming.get_naming(ty)
    }

    /// the naming registry
    pub fn naming(&mut self) -> &mut NamingRegistry {
        &mut self.naming
    }

    /// Bind the router factory for `ty`.
    pub fn set_router_factory(&mut self, ty: RouterType, factory: Box<dyn RouterFactory>) {
        self.routing.set_factory(ty, factory);
    }

    /// The router named `name`, created as `ty` on first request; later
    /// requests get the cached router whatever `ty` they pass. Handles
    /// resolved at creation are applied to the dispatch table right away.
    pub fn get_router(&mut self, name: &str, ty: RouterType) -> RoutingResult<&mut dyn Router> {
        self.routing
            .get_router(name, ty, &mut self.naming, self.transport.as_mut())?;
        self.apply_route_diffs();
        self.routing
            .router(name)
            .ok_or_else(|| routing::RoutingError::NotFound(name.to_owned()))
    }

    /// Drop router `name`, closing and detaching its handles.
    pub fn remove_router(&mut self, name: &str) -> Option<Box<dyn Router>> {
        let router = self.routing.remove_router(name, self.transport.as_mut());
        self.apply_route_diffs();
        self.dispatch.detach_router(name);
        router
    }

    /// the routing table
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    // -----------------------------------------------------------------------
    // tasks, timers, calls, stats
    // -----------------------------------------------------------------------

    /// Spawn a cooperative task; it first runs on the next tick.
    pub fn spawn(&self, routine: impl Future<Output = ()> + 'static) -> TaskResult<TaskId> {
        self.tasks.spawn(routine)
    }

    /// Abort a task. Returns false if it already finished.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.tasks.cancel(id)
    }

    /// the task scheduler
    pub fn tasks(&self) -> &TaskScheduler {
        &self.tasks
    }

    /// handle for starting timers and sleeps
    pub fn timer(&self) -> &TimerHandle {
        &self.timer
    }

    /// outstanding RPC calls
    pub fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    /// resource statistics
    pub fn stats(&self) -> &StatManager {
        &self.stats
    }

    /// `Send` handle for other threads
    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            tx: self.handoff_tx.clone(),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.timer.stop_timer(self.stat_timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn driver() -> Driver {
        let config = DriverConfig {
            default_naming: NamingType::Static,
            ..DriverConfig::default()
        };
        Driver::new(config, Box::new(MemoryTransport::new()))
    }

    #[test]
    fn test_idle_tick() {
        let mut driver = driver();
        assert_eq!(driver.update(), 0);
        assert_eq!(driver.update(), 0);
        assert!(driver.routing().is_empty());
        assert!(driver.dispatch().is_empty());
        assert!(driver.last_message_info().is_none());
        assert_eq!(driver.stats().current(LOOP_ITEM).map(|w| w.count), Some(2));
    }

    #[test]
    fn test_handoff_runs_on_next_tick() {
        let mut driver = driver();
        let handle = driver.handle();
        handle
            .execute(|driver| {
                driver.connect("mem://from-thread").unwrap();
            })
            .unwrap();
        // the job, then the PeerConnected event it caused
        assert_eq!(driver.update(), 2);
        drop(driver);
        assert!(handle.is_closed());
        assert_eq!(handle.execute(|_| {}), Err(DriverGone));
    }

    #[test]
    fn test_send_failure_fails_call() {
        let mut driver = driver();
        let (id, reply) = driver.calls().call(Handle(42), |_| bytes::Bytes::new());
        driver.update();
        assert_eq!(
            futures::FutureExt::now_or_never(reply),
            Some(Err(CallError::Send(
                crate::transport::TransportError::UnknownHandle(Handle(42))
            )))
        );
        assert!(driver.calls().fail(id, CallError::Cancelled).is_err());
    }
}
