//! Named routers over resolved address sets.
//!
//! A router is created through the factory of its [`RouterType`] the first
//! time its name is requested and cached by name from then on. Later requests
//! return the cached router whatever type they ask for.
//!
//! On creation the name is watched on the table's default naming type. Each
//! address-set change of the name is turned into transport handles (connect
//! for new urls, close for gone ones) and a [`HandleDiff`] against the handle
//! set last reported for the route.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

use naming::{NameChange, NamingRegistry, NamingType};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    metrics,
    transport::{Handle, Transport},
};

/// The closed set of router variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterType {
    /// rotate through the routes
    RoundRobin,
    /// `key % len`
    Hash,
    /// uniformly random
    Random,
}

impl RouterType {
    /// lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterType::RoundRobin => "round_robin",
            RouterType::Hash => "hash",
            RouterType::Random => "random",
        }
    }
}

impl fmt::Display for RouterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouterType {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(RouterType::RoundRobin),
            "hash" => Ok(RouterType::Hash),
            "random" => Ok(RouterType::Random),
            other => Err(RoutingError::UnknownRouterName(other.to_owned())),
        }
    }
}

/// Errors returned by the routing table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// router names are non-empty
    #[error("router name must not be empty")]
    EmptyName,
    /// no factory is bound for the type
    #[error("router type {0} is not registered")]
    UnknownType(RouterType),
    /// the string does not name a router type
    #[error("unknown router type: {0}")]
    UnknownRouterName(String),
    /// a live router already has the name
    #[error("router {0} already exists")]
    Exists(String),
    /// no router has the name
    #[error("no router named {0}")]
    NotFound(String),
}

impl RoutingError {
    /// Returns true for errors caused by bad arguments or setup.
    pub fn is_config(&self) -> bool {
        !matches!(self, RoutingError::NotFound(_))
    }
}

/// Shorthand result alias for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Picks a handle out of a route's current handle set.
pub trait Router: fmt::Debug {
    /// variant
    fn router_type(&self) -> RouterType;

    /// Replace the handle set.
    fn set_routes(&mut self, routes: Vec<Handle>);

    /// current handle set
    fn routes(&self) -> &[Handle];

    /// Pick a handle for `key`; None when there are no routes.
    fn route(&mut self, key: u64) -> Option<Handle>;
}

/// Builds routers of one type.
pub trait RouterFactory: fmt::Debug {
    /// Make a router for `name`.
    fn create(&self, name: &str) -> Box<dyn Router>;
}

/// Rotates through the routes, ignoring the key
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    routes: Vec<Handle>,
    next: usize,
}

impl Router for RoundRobinRouter {
    fn router_type(&self) -> RouterType {
        RouterType::RoundRobin
    }

    fn set_routes(&mut self, routes: Vec<Handle>) {
        self.routes = routes;
    }

    fn routes(&self) -> &[Handle] {
        &self.routes
    }

    fn route(&mut self, _key: u64) -> Option<Handle> {
        if self.routes.is_empty() {
            return None;
        }
        let handle = self.routes[self.next % self.routes.len()];
        self.next = self.next.wrapping_add(1);
        Some(handle)
    }
}

/// Picks `routes[key % len]`
#[derive(Debug, Default)]
pub struct HashRouter {
    routes: Vec<Handle>,
}

impl Router for HashRouter {
    fn router_type(&self) -> RouterType {
        RouterType::Hash
    }

    fn set_routes(&mut self, routes: Vec<Handle>) {
        self.routes = routes;
    }

    fn routes(&self) -> &[Handle] {
        &self.routes
    }

    fn route(&mut self, key: u64) -> Option<Handle> {
        let len = self.routes.len() as u64;
        if len == 0 {
            return None;
        }
        Some(self.routes[(key % len) as usize])
    }
}

/// Picks uniformly at random
#[derive(Debug)]
pub struct RandomRouter {
    routes: Vec<Handle>,
    rng: StdRng,
}

impl RandomRouter {
    /// seeded from the OS
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// deterministic, for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            routes: Vec::new(),
            rng,
        }
    }
}

impl Default for RandomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for RandomRouter {
    fn router_type(&self) -> RouterType {
        RouterType::Random
    }

    fn set_routes(&mut self, routes: Vec<Handle>) {
        self.routes = routes;
    }

    fn routes(&self) -> &[Handle] {
        &self.routes
    }

    fn route(&mut self, _key: u64) -> Option<Handle> {
        if self.routes.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.routes.len());
        Some(self.routes[i])
    }
}

/// Factory for the built-in router types
#[derive(Debug, Clone, Copy)]
pub struct BuiltinRouterFactory(pub RouterType);

impl RouterFactory for BuiltinRouterFactory {
    fn create(&self, _name: &str) -> Box<dyn Router> {
        match self.0 {
            RouterType::RoundRobin => Box::<RoundRobinRouter>::default(),
            RouterType::Hash => Box::<HashRouter>::default(),
            RouterType::Random => Box::new(RandomRouter::new()),
        }
    }
}

/// Handles that left and joined a route
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleDiff {
    /// in the old set only
    pub detached: Vec<Handle>,
    /// in the new set only
    pub attached: Vec<Handle>,
}

impl HandleDiff {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.detached.is_empty() && self.attached.is_empty()
    }
}

/// Symmetric difference of two handle sets. Handles in both are in neither
/// side of the result; order follows the inputs.
pub fn diff_handles(old: &[Handle], new: &[Handle]) -> HandleDiff {
    let old_set: BTreeSet<Handle> = old.iter().copied().collect();
    let new_set: BTreeSet<Handle> = new.iter().copied().collect();
    HandleDiff {
        detached: old.iter().copied().filter(|h| !new_set.contains(h)).collect(),
        attached: new.iter().copied().filter(|h| !old_set.contains(h)).collect(),
    }
}

/// A routing change waiting to be applied to the dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDiff {
    /// router name
    pub name: String,
    /// what changed
    pub diff: HandleDiff,
}

#[derive(Debug)]
struct RouteEntry {
    router: Box<dyn Router>,
    /// naming type the name is watched on
    naming: NamingType,
    /// url -> handle opened for it
    urls: BTreeMap<String, Handle>,
    /// handles last reported, in url order
    last_handles: Vec<Handle>,
}

/// Cache of named routers
#[derive(Debug)]
pub struct RoutingTable {
    default_naming: NamingType,
    factories: HashMap<RouterType, Box<dyn RouterFactory>>,
    routes: BTreeMap<String, RouteEntry>,
    diffs: Vec<RouteDiff>,
}

impl RoutingTable {
    /// Empty table with no factories; routers watch their names on
    /// `default_naming`.
    pub fn new(default_naming: NamingType) -> Self {
        Self {
            default_naming,
            factories: HashMap::new(),
            routes: BTreeMap::new(),
            diffs: Vec::new(),
        }
    }

    /// Table with a factory for every [`RouterType`].
    pub fn with_builtin_factories(default_naming: NamingType) -> Self {
        let mut table = Self::new(default_naming);
        for ty in [RouterType::RoundRobin, RouterType::Hash, RouterType::Random] {
            table.set_factory(ty, Box::new(BuiltinRouterFactory(ty)));
        }
        table
    }

    /// naming type new routers watch their name on
    pub fn default_naming(&self) -> NamingType {
        self.default_naming
    }

    /// Bind the factory for `ty`, returning the one it replaces. Cached
    /// routers are kept.
    pub fn set_factory(
        &mut self,
        ty: RouterType,
        factory: Box<dyn RouterFactory>,
    ) -> Option<Box<dyn RouterFactory>> {
        self.factories.insert(ty, factory)
    }

    /// Returns true if a factory is bound for `ty`.
    pub fn has_factory(&self, ty: RouterType) -> bool {
        self.factories.contains_key(&ty)
    }

    /// The router named `name`, created with the `ty` factory on first
    /// request. A cached router is returned as is, even when `ty` differs
    /// from the type it was created with.
    ///
    /// A new router watches `name` on the default naming type and takes the
    /// addresses already resolved for it. A failure there is logged and the
    /// router is cached regardless.
    pub fn get_router(
        &mut self,
        name: &str,
        ty: RouterType,
        naming: &mut NamingRegistry,
        transport: &mut dyn Transport,
    ) -> RoutingResult<&mut dyn Router> {
        if name.is_empty() {
            return Err(RoutingError::EmptyName);
        }
        if !self.routes.contains_key(name) {
            let factory = self
                .factories
                .get(&ty)
                .ok_or(RoutingError::UnknownType(ty))?;
            let router = factory.create(name);
            info!(router = name, %ty, naming = %self.default_naming, "router created");
            self.routes.insert(
                name.to_owned(),
                RouteEntry {
                    router,
                    naming: self.default_naming,
                    urls: BTreeMap::new(),
                    last_handles: Vec::new(),
                },
            );
            metrics::ROUTES.set(self.routes.len() as i64);
            self.init_route(name, naming, transport);
        }
        match self.routes.get_mut(name) {
            Some(entry) => {
                if entry.router.router_type() != ty {
                    debug!(router = name, cached = %entry.router.router_type(), requested = %ty, "cached router returned");
                }
                Ok(entry.router.as_mut())
            }
            None => Err(RoutingError::NotFound(name.to_owned())),
        }
    }

    fn init_route(&mut self, name: &str, naming: &mut NamingRegistry, transport: &mut dyn Transport) {
        let resolver = match naming.get_naming(self.default_naming) {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(router = name, ?err, "router init failed, no naming instance");
                return;
            }
        };
        if let Err(err) = resolver.watch_name(name) {
            warn!(router = name, ?err, "router init failed, name not watched");
            return;
        }
        let urls = resolver
            .get_urls(name)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        if !urls.is_empty() {
            let change = NameChange {
                name: name.to_owned(),
                urls,
            };
            self.apply_change(self.default_naming, &change, transport);
        }
    }

    /// Register a router built elsewhere under `name`, watching nothing.
    /// A live router under the same name is an error.
    pub fn insert_router(&mut self, name: &str, router: Box<dyn Router>) -> RoutingResult<()> {
        if name.is_empty() {
            return Err(RoutingError::EmptyName);
        }
        if self.routes.contains_key(name) {
            return Err(RoutingError::Exists(name.to_owned()));
        }
        self.routes.insert(
            name.to_owned(),
            RouteEntry {
                router,
                naming: self.default_naming,
                urls: BTreeMap::new(),
                last_handles: Vec::new(),
            },
        );
        metrics::ROUTES.set(self.routes.len() as i64);
        Ok(())
    }

    /// Drop router `name`, closing its handles. A diff detaching them is
    /// queued.
    pub fn remove_router(
        &mut self,
        name: &str,
        transport: &mut dyn Transport,
    ) -> Option<Box<dyn Router>> {
        let entry = self.routes.remove(name)?;
        metrics::ROUTES.set(self.routes.len() as i64);
        for (url, handle) in &entry.urls {
            if let Err(err) = transport.close(*handle) {
                warn!(router = name, %url, ?err, "failed to close route");
            }
        }
        if !entry.last_handles.is_empty() {
            self.diffs.push(RouteDiff {
                name: name.to_owned(),
                diff: diff_handles(&entry.last_handles, &[]),
            });
        }
        Some(entry.router)
    }

    /// cached router `name`
    pub fn router(&mut self, name: &str) -> Option<&mut dyn Router> {
        match self.routes.get_mut(name) {
            Some(entry) => Some(entry.router.as_mut()),
            None => None,
        }
    }

    /// Pick a handle of router `name` for `key`.
    pub fn route(&mut self, name: &str, key: u64) -> Option<Handle> {
        self.routes.get_mut(name)?.router.route(key)
    }

    /// Handles last reported for `name`.
    pub fn last_handles(&self, name: &str) -> Option<&[Handle]> {
        self.routes.get(name).map(|entry| entry.last_handles.as_slice())
    }

    /// Returns true if a router named `name` is cached.
    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// cached router names
    pub fn names(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    /// count of cached routers
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no router is cached.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Fold an address-set change reported by the `naming_type` resolver into
    /// the route of the same name. Returns true if the route's handles
    /// changed; the diff is queued for [`take_diffs`](RoutingTable::take_diffs).
    pub fn apply_change(
        &mut self,
        naming_type: NamingType,
        change: &NameChange,
        transport: &mut dyn Transport,
    ) -> bool {
        let Some(entry) = self.routes.get_mut(&change.name) else {
            debug!(name = %change.name, "address change for a name with no router");
            return false;
        };
        if entry.naming != naming_type {
            return false;
        }

        let wanted: BTreeSet<&str> = change.urls.iter().map(String::as_str).collect();
        let gone: Vec<String> = entry
            .urls
            .keys()
            .filter(|url| !wanted.contains(url.as_str()))
            .cloned()
            .collect();
        for url in gone {
            if let Some(handle) = entry.urls.remove(&url) {
                if let Err(err) = transport.close(handle) {
                    warn!(router = %change.name, %url, ?err, "failed to close route");
                }
            }
        }
        for url in wanted {
            if entry.urls.contains_key(url) {
                continue;
            }
            match transport.connect(url) {
                Ok(handle) => {
                    entry.urls.insert(url.to_owned(), handle);
                }
                Err(err) => warn!(router = %change.name, %url, ?err, "failed to open route"),
            }
        }

        let handles: Vec<Handle> = entry.urls.values().copied().collect();
        let diff = diff_handles(&entry.last_handles, &handles);
        entry.router.set_routes(handles.clone());
        entry.last_handles = handles;
        if diff.is_empty() {
            return false;
        }
        debug!(router = %change.name, detached = ?diff.detached, attached = ?diff.attached, "route changed");
        self.diffs.push(RouteDiff {
            name: change.name.clone(),
            diff,
        });
        true
    }

    /// Drain queued route diffs.
    pub fn take_diffs(&mut self) -> Vec<RouteDiff> {
        std::mem::take(&mut self.diffs)
    }
}
