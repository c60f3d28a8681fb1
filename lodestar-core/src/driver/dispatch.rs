//! Handle to processor bindings.
//!
//! [`ProcessorRegistry`] owns the processors; removing one from it is the
//! only way one is destroyed. [`DispatchTable`] maps each connection handle to
//! at most one processor and forwards inbound messages along that mapping.
//! Router bindings let routing changes attach and detach handles without the
//! owner's involvement.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    driver::routing::HandleDiff,
    metrics,
    processor::{MessageFlags, Processor, ProcessorContext, ProcessorId},
    transport::{Handle, MessageInfo},
};

/// Errors returned by the dispatch table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// processor id is not registered
    #[error("unknown {0}")]
    UnknownProcessor(ProcessorId),
    /// handle has no processor bound
    #[error("handle {0} is not attached")]
    NotAttached(Handle),
    /// message arrived on a handle with no processor bound
    #[error("no processor bound to handle {0}, message dropped")]
    Unbound(Handle),
}

/// Shorthand result alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Owning registry of processors
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    next_id: u64,
    processors: BTreeMap<ProcessorId, Box<dyn Processor>>,
}

impl ProcessorRegistry {
    /// Make an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `processor`.
    pub fn add(&mut self, processor: Box<dyn Processor>) -> ProcessorId {
        self.next_id += 1;
        let id = ProcessorId(self.next_id);
        debug!(%id, name = processor.name(), "processor added");
        self.processors.insert(id, processor);
        metrics::PROCESSORS.set(self.processors.len() as i64);
        id
    }

    /// Give `id` back to the caller. Bindings are the dispatch table's to
    /// clean up.
    pub fn remove(&mut self, id: ProcessorId) -> Option<Box<dyn Processor>> {
        let removed = self.processors.remove(&id);
        metrics::PROCESSORS.set(self.processors.len() as i64);
        removed
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: ProcessorId) -> bool {
        self.processors.contains_key(&id)
    }

    /// processor registered as `id`
    pub fn get(&self, id: ProcessorId) -> Option<&dyn Processor> {
        self.processors.get(&id).map(|p| &**p)
    }

    /// processor registered as `id`
    pub fn get_mut(&mut self, id: ProcessorId) -> Option<&mut dyn Processor> {
        match self.processors.get_mut(&id) {
            Some(processor) => Some(processor.as_mut()),
            None => None,
        }
    }

    /// count of processors
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Returns true if no processor is registered.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run every processor's maintenance; returns the summed event count.
    pub fn update_all(&mut self) -> usize {
        self.processors.values_mut().map(|p| p.update()).sum()
    }

    /// Every processor's resource items, keyed `<processor name>.<item>`.
    pub fn resource_used(&self) -> Vec<(String, i64)> {
        let mut items: Vec<(String, i64)> = self
            .processors
            .values()
            .flat_map(|p| {
                p.resource_used()
                    .into_iter()
                    .map(move |(item, value)| (format!("{}.{item}", p.name()), value))
            })
            .collect();
        items.sort_unstable();
        items
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    processor: ProcessorId,
    routed: bool,
    /// no message dispatched since the bind
    fresh: bool,
}

/// Handle to processor map
#[derive(Debug, Default)]
pub struct DispatchTable {
    bindings: HashMap<Handle, Binding>,
    routers: BTreeMap<String, ProcessorId>,
}

impl DispatchTable {
    /// Make an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` to `processor`, replacing any previous binding. Returns
    /// the processor it was bound to before.
    pub fn attach(
        &mut self,
        handle: Handle,
        processor: ProcessorId,
        processors: &ProcessorRegistry,
    ) -> DispatchResult<Option<ProcessorId>> {
        self.bind(handle, processor, false, processors)
    }

    fn bind(
        &mut self,
        handle: Handle,
        processor: ProcessorId,
        routed: bool,
        processors: &ProcessorRegistry,
    ) -> DispatchResult<Option<ProcessorId>> {
        if !processors.contains(processor) {
            return Err(DispatchError::UnknownProcessor(processor));
        }
        let previous = self.bindings.insert(
            handle,
            Binding {
                processor,
                routed,
                fresh: true,
            },
        );
        trace!(%handle, %processor, routed, "handle attached");
        Ok(previous.map(|binding| binding.processor))
    }

    /// Remove the binding of `handle`.
    pub fn detach(&mut self, handle: Handle) -> DispatchResult<ProcessorId> {
        match self.bindings.remove(&handle) {
            Some(binding) => {
                trace!(%handle, processor = %binding.processor, "handle detached");
                Ok(binding.processor)
            }
            None => Err(DispatchError::NotAttached(handle)),
        }
    }

    /// processor bound to `handle`
    pub fn lookup(&self, handle: Handle) -> Option<ProcessorId> {
        self.bindings.get(&handle).map(|binding| binding.processor)
    }

    /// handles bound to `processor`, sorted
    pub fn handles_of(&self, processor: ProcessorId) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .bindings
            .iter()
            .filter(|(_, binding)| binding.processor == processor)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// count of bound handles
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if no handle is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Route future membership changes of router `name` to `processor`.
    /// Returns the processor previously bound to the router.
    pub fn attach_router(
        &mut self,
        name: &str,
        processor: ProcessorId,
        processors: &ProcessorRegistry,
    ) -> DispatchResult<Option<ProcessorId>> {
        if !processors.contains(processor) {
            return Err(DispatchError::UnknownProcessor(processor));
        }
        debug!(router = name, %processor, "router attached");
        Ok(self.routers.insert(name.to_owned(), processor))
    }

    /// Stop following router `name`. Handles already bound stay bound.
    pub fn detach_router(&mut self, name: &str) -> Option<ProcessorId> {
        self.routers.remove(name)
    }

    /// processor following router `name`
    pub fn router_processor(&self, name: &str) -> Option<ProcessorId> {
        self.routers.get(name).copied()
    }

    /// Apply a routing change of router `name`: detach what left, attach what
    /// joined. Handles in both sets are not touched. Returns how many
    /// bindings changed; 0 if no processor follows the router.
    pub fn apply_route_diff(
        &mut self,
        name: &str,
        diff: &HandleDiff,
        processors: &ProcessorRegistry,
    ) -> usize {
        let Some(processor) = self.router_processor(name) else {
            trace!(router = name, "routing change with no attached processor");
            return 0;
        };
        let mut changed = 0;
        for handle in &diff.detached {
            match self.detach(*handle) {
                Ok(_) => {
                    metrics::ROUTE_DETACH.inc();
                    changed += 1;
                }
                Err(err) => debug!(router = name, ?err, "stale route already detached"),
            }
        }
        for handle in &diff.attached {
            match self.bind(*handle, processor, true, processors) {
                Ok(_) => {
                    metrics::ROUTE_ATTACH.inc();
                    changed += 1;
                }
                Err(err) => warn!(router = name, ?err, "failed to attach route"),
            }
        }
        changed
    }

    /// Drop every binding of `processor`, including router bindings. Returns
    /// the handles that were bound.
    pub fn detach_processor(&mut self, processor: ProcessorId) -> Vec<Handle> {
        let handles = self.handles_of(processor);
        for handle in &handles {
            self.bindings.remove(handle);
        }
        self.routers.retain(|_, bound| *bound != processor);
        handles
    }

    /// Hand `payload` to the processor bound to `handle`. A handle with no
    /// binding drops the message and reports [`DispatchError::Unbound`].
    pub fn dispatch(
        &mut self,
        handle: Handle,
        payload: Bytes,
        info: &MessageInfo,
        processors: &mut ProcessorRegistry,
        ctx: &mut ProcessorContext<'_>,
    ) -> DispatchResult<ProcessorId> {
        let Some(binding) = self.bindings.get_mut(&handle) else {
            metrics::UNBOUND_DISPATCH.inc();
            warn!(%handle, len = payload.len(), "no processor bound, message dropped");
            return Err(DispatchError::Unbound(handle));
        };
        let mut flags = MessageFlags::empty();
        if binding.routed {
            flags = flags.with(MessageFlags::ROUTED);
        }
        if std::mem::take(&mut binding.fresh) {
            flags = flags.with(MessageFlags::FIRST);
        }
        let id = binding.processor;
        match processors.get_mut(id) {
            Some(processor) => {
                metrics::DISPATCHED.inc();
                processor.on_message(ctx, handle, payload, info, flags);
                Ok(id)
            }
            // removal detaches, so this is a stale binding
            None => {
                self.bindings.remove(&handle);
                metrics::UNBOUND_DISPATCH.inc();
                warn!(%handle, processor = %id, "bound processor is gone, message dropped");
                Err(DispatchError::Unbound(handle))
            }
        }
    }
}

impl fmt::Display for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} handles, {} routers",
            self.bindings.len(),
            self.routers.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Nop;

    impl Processor for Nop {
        fn name(&self) -> &str {
            "nop"
        }

        fn on_message(
            &mut self,
            _ctx: &mut ProcessorContext<'_>,
            _remote: Handle,
            _payload: Bytes,
            _info: &MessageInfo,
            _flags: MessageFlags,
        ) {
        }

        fn resource_used(&self) -> std::collections::HashMap<String, i64> {
            [("queued".to_owned(), 2)].into()
        }
    }

    fn registry() -> (ProcessorRegistry, ProcessorId, ProcessorId) {
        let mut processors = ProcessorRegistry::new();
        let a = processors.add(Box::new(Nop));
        let b = processors.add(Box::new(Nop));
        (processors, a, b)
    }

    #[test]
    fn test_attach_is_last_write_wins() {
        let (processors, a, b) = registry();
        let mut table = DispatchTable::new();
        assert_eq!(table.attach(Handle(1), a, &processors), Ok(None));
        assert_eq!(table.attach(Handle(1), b, &processors), Ok(Some(a)));
        assert_eq!(table.lookup(Handle(1)), Some(b));
        assert_eq!(
            table.attach(Handle(1), ProcessorId(99), &processors),
            Err(DispatchError::UnknownProcessor(ProcessorId(99)))
        );
        assert_eq!(table.lookup(Handle(1)), Some(b));
    }

    #[test]
    fn test_detach_unbound_has_no_side_effect() {
        let (processors, a, _) = registry();
        let mut table = DispatchTable::new();
        table.attach(Handle(1), a, &processors).unwrap();
        assert_eq!(
            table.detach(Handle(2)),
            Err(DispatchError::NotAttached(Handle(2)))
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.detach(Handle(1)), Ok(a));
        assert!(table.detach(Handle(1)).is_err());
    }

    #[test]
    fn test_route_diff_and_processor_removal() {
        let (mut processors, a, _) = registry();
        let mut table = DispatchTable::new();
        let diff = HandleDiff {
            detached: vec![],
            attached: vec![Handle(1), Handle(2)],
        };
        // nobody follows the router yet
        assert_eq!(table.apply_route_diff("echo", &diff, &processors), 0);

        table.attach_router("echo", a, &processors).unwrap();
        assert_eq!(table.apply_route_diff("echo", &diff, &processors), 2);
        let diff = HandleDiff {
            detached: vec![Handle(1)],
            attached: vec![Handle(3)],
        };
        assert_eq!(table.apply_route_diff("echo", &diff, &processors), 2);
        assert_eq!(table.handles_of(a), vec![Handle(2), Handle(3)]);

        processors.remove(a);
        assert_eq!(table.detach_processor(a), vec![Handle(2), Handle(3)]);
        assert!(table.is_empty());
        assert_eq!(table.router_processor("echo"), None);
    }

    #[test]
    fn test_resource_items_are_prefixed() {
        let (processors, _, _) = registry();
        assert_eq!(
            processors.resource_used(),
            vec![("nop.queued".to_owned(), 2), ("nop.queued".to_owned(), 2)]
        );
    }
}
