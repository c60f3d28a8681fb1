//! Static name table, configured at startup and edited through
//! `register`/`unregister`.
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{
    NameChange, Naming, NamingConfig, NamingError, NamingFactory, NamingResult, NamingType,
    normalize_urls, validate_name,
};

/// In-process resolver over a `name -> instance -> url` table.
#[derive(Debug, Default)]
pub struct StaticNaming {
    table: BTreeMap<String, BTreeMap<String, String>>,
    /// resolved (sorted) urls, per name
    urls: BTreeMap<String, Vec<String>>,
    watched: BTreeSet<String>,
    dirty: BTreeSet<String>,
}

impl StaticNaming {
    /// Build from `name -> urls`; instances are named `static-<n>`.
    pub fn with_routes(routes: BTreeMap<String, Vec<String>>) -> Self {
        let mut naming = StaticNaming::default();
        for (name, urls) in routes {
            let instances = urls
                .into_iter()
                .enumerate()
                .map(|(i, url)| (format!("static-{i}"), url))
                .collect();
            naming.table.insert(name.clone(), instances);
            naming.refresh(&name);
        }
        naming
    }

    fn refresh(&mut self, name: &str) {
        let urls = normalize_urls(
            self.table
                .get(name)
                .map(|instances| instances.values().cloned().collect())
                .unwrap_or_default(),
        );
        if self.urls.get(name) != Some(&urls) {
            if self.watched.contains(name) {
                self.dirty.insert(name.to_owned());
            }
            self.urls.insert(name.to_owned(), urls);
        }
    }
}

impl Naming for StaticNaming {
    fn naming_type(&self) -> NamingType {
        NamingType::Static
    }

    fn watch_name(&mut self, name: &str) -> NamingResult<()> {
        validate_name(name)?;
        if self.watched.insert(name.to_owned()) {
            debug!(name, "watching static name");
            // nothing to report until the name has members
            if !self.urls.entry(name.to_owned()).or_default().is_empty() {
                self.dirty.insert(name.to_owned());
            }
        }
        Ok(())
    }

    fn unwatch_name(&mut self, name: &str) -> NamingResult<()> {
        self.dirty.remove(name);
        if self.watched.remove(name) {
            Ok(())
        } else {
            Err(NamingError::NotFound(name.to_owned()))
        }
    }

    fn get_urls(&self, name: &str) -> Option<&[String]> {
        self.urls.get(name).map(Vec::as_slice)
    }

    fn resolve_blocking(&mut self, name: &str) -> NamingResult<Vec<String>> {
        validate_name(name)?;
        Ok(self.urls.get(name).cloned().unwrap_or_default())
    }

    fn register(&mut self, name: &str, url: &str, instance: &str) -> NamingResult<()> {
        validate_name(name)?;
        if instance.is_empty() || instance.contains('/') {
            return Err(NamingError::InvalidName(instance.to_owned()));
        }
        self.table
            .entry(name.to_owned())
            .or_default()
            .insert(instance.to_owned(), url.to_owned());
        self.refresh(name);
        Ok(())
    }

    fn unregister(&mut self, name: &str, instance: &str) -> NamingResult<()> {
        let removed = self
            .table
            .get_mut(name)
            .and_then(|instances| instances.remove(instance));
        match removed {
            Some(_) => {
                self.refresh(name);
                Ok(())
            }
            None => Err(NamingError::NotFound(format!("{name}/{instance}"))),
        }
    }

    fn update(&mut self) -> usize {
        0
    }

    fn take_changes(&mut self) -> Vec<NameChange> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .map(|name| NameChange {
                urls: self.urls.get(&name).cloned().unwrap_or_default(),
                name,
            })
            .collect()
    }
}

/// Builds [`StaticNaming`] resolvers seeded with a fixed route table.
#[derive(Debug, Clone, Default)]
pub struct StaticNamingFactory {
    routes: BTreeMap<String, Vec<String>>,
}

impl StaticNamingFactory {
    /// Factory for resolvers with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for resolvers seeded with `name -> urls`.
    pub fn with_routes(routes: BTreeMap<String, Vec<String>>) -> Self {
        Self { routes }
    }
}

impl NamingFactory for StaticNamingFactory {
    fn create(&self, _config: &NamingConfig) -> NamingResult<Box<dyn Naming>> {
        for name in self.routes.keys() {
            validate_name(name)?;
        }
        Ok(Box::new(StaticNaming::with_routes(self.routes.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            "echo".to_owned(),
            vec!["mem://y".to_owned(), "mem://x".to_owned()],
        )])
    }

    #[test]
    fn test_watch_reports_current_set() {
        let mut naming = StaticNaming::with_routes(routes());
        assert!(naming.take_changes().is_empty());
        naming.watch_name("echo").unwrap();
        assert_eq!(
            naming.take_changes(),
            vec![NameChange {
                name: "echo".into(),
                urls: vec!["mem://x".into(), "mem://y".into()],
            }]
        );
        assert!(naming.take_changes().is_empty());
    }

    #[test]
    fn test_unknown_name_is_quiet_until_registered() {
        let mut naming = StaticNaming::with_routes(routes());
        naming.watch_name("late").unwrap();
        assert!(naming.take_changes().is_empty());
        assert_eq!(naming.get_urls("late"), Some(&[][..]));

        naming.register("late", "mem://a", "a").unwrap();
        assert_eq!(
            naming.take_changes(),
            vec![NameChange {
                name: "late".into(),
                urls: vec!["mem://a".into()],
            }]
        );
    }

    #[test]
    fn test_changes_coalesce_per_name() {
        let mut naming = StaticNaming::with_routes(routes());
        naming.watch_name("echo").unwrap();
        naming.take_changes();

        naming.unregister("echo", "static-1").unwrap();
        naming.register("echo", "mem://z", "z").unwrap();
        let changes = naming.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].urls, vec!["mem://y".to_owned(), "mem://z".to_owned()]);

        // same set again: nothing to report
        naming.register("echo", "mem://z", "z2").unwrap();
        assert!(naming.take_changes().is_empty());
    }

    #[test]
    fn test_errors() {
        let mut naming = StaticNaming::default();
        assert_eq!(
            naming.unwatch_name("nope"),
            Err(NamingError::NotFound("nope".into()))
        );
        assert!(naming.unregister("echo", "a").is_err());
        assert!(naming.register("", "mem://a", "a").is_err());
        assert!(naming.register("echo", "mem://a", "a/b").is_err());
        assert_eq!(naming.get_urls("echo"), None);
    }

    #[test]
    fn test_factory_rejects_bad_names() {
        let factory = StaticNamingFactory::with_routes(BTreeMap::from([(
            "/bad".to_owned(),
            vec![],
        )]));
        assert!(factory.create(&NamingConfig::default()).is_err());
    }
}
