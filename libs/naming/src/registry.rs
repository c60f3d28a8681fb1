//! Per-type factory map with lazily built, cached resolvers.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use tracing::{debug, info};

use crate::{
    NameChange, Naming, NamingConfig, NamingError, NamingFactory, NamingResult, NamingType,
};

/// Owns the naming factories and the single resolver built for each type.
pub struct NamingRegistry {
    config: NamingConfig,
    factories: HashMap<NamingType, Box<dyn NamingFactory>>,
    instances: BTreeMap<NamingType, Box<dyn Naming>>,
}

impl fmt::Debug for NamingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamingRegistry")
            .field("config", &self.config)
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("instances", &self.instances)
            .finish()
    }
}

impl NamingRegistry {
    /// Make an empty registry; resolvers are built with `config`.
    pub fn new(config: NamingConfig) -> Self {
        Self {
            config,
            factories: HashMap::new(),
            instances: BTreeMap::new(),
        }
    }

    /// config handed to factories
    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Bind the factory for `ty`, returning the one it replaces. A resolver
    /// already built for `ty` is kept.
    pub fn set_factory(
        &mut self,
        ty: NamingType,
        factory: Box<dyn NamingFactory>,
    ) -> Option<Box<dyn NamingFactory>> {
        debug!(naming = %ty, "naming factory bound");
        self.factories.insert(ty, factory)
    }

    /// Returns true if a factory is bound for `ty`.
    pub fn has_factory(&self, ty: NamingType) -> bool {
        self.factories.contains_key(&ty)
    }

    /// The cached resolver for `ty`, built on first request.
    pub fn get_naming(&mut self, ty: NamingType) -> NamingResult<&mut dyn Naming> {
        if !self.instances.contains_key(&ty) {
            let factory = self.factories.get(&ty).ok_or(NamingError::Unsupported(ty))?;
            let naming = factory.create(&self.config)?;
            info!(naming = %ty, "naming instance created");
            self.instances.insert(ty, naming);
        }
        match self.instances.get_mut(&ty) {
            Some(naming) => Ok(naming.as_mut()),
            None => Err(NamingError::Unsupported(ty)),
        }
    }

    /// The resolver for `ty` if one was built.
    pub fn existing(&mut self, ty: NamingType) -> Option<&mut dyn Naming> {
        match self.instances.get_mut(&ty) {
            Some(naming) => Some(naming.as_mut()),
            None => None,
        }
    }

    /// types with a live resolver
    pub fn active_types(&self) -> Vec<NamingType> {
        self.instances.keys().copied().collect()
    }

    /// Update every live resolver; returns the summed event count.
    pub fn update(&mut self) -> usize {
        self.instances.values_mut().map(|naming| naming.update()).sum()
    }

    /// Drain the changes of every live resolver.
    pub fn take_changes(&mut self) -> Vec<(NamingType, NameChange)> {
        self.instances
            .iter_mut()
            .flat_map(|(ty, naming)| naming.take_changes().into_iter().map(|c| (*ty, c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::StaticNamingFactory;

    #[test]
    fn test_unregistered_type_is_an_error() {
        let mut registry = NamingRegistry::new(NamingConfig::default());
        assert_eq!(
            registry.get_naming(NamingType::Coordination).unwrap_err(),
            NamingError::Unsupported(NamingType::Coordination)
        );
        assert!(registry.active_types().is_empty());
    }

    #[test]
    fn test_instance_is_cached_per_type() {
        let mut registry = NamingRegistry::new(NamingConfig::default());
        let routes = BTreeMap::from([("echo".to_owned(), vec!["mem://a".to_owned()])]);
        registry.set_factory(
            NamingType::Static,
            Box::new(StaticNamingFactory::with_routes(routes)),
        );
        assert!(registry.existing(NamingType::Static).is_none());

        let naming = registry.get_naming(NamingType::Static).unwrap();
        assert_eq!(naming.naming_type(), NamingType::Static);
        naming.register("echo", "mem://b", "b").unwrap();

        // same instance: the registration above is visible
        let naming = registry.get_naming(NamingType::Static).unwrap();
        assert_eq!(naming.resolve_blocking("echo").unwrap().len(), 2);
        assert_eq!(registry.active_types(), vec![NamingType::Static]);
    }
}
