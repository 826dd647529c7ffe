//! Strategy registry: name-to-factory lookup for agents, models and data
//! modules.
//!
//! Strategies are registered once at start-up. After that the registry is
//! shared behind an `Arc` and only read.

use crate::error::StrategyError;
use crate::strategies::{DataModule, Model, StrategyArgs};
use crate::training::agent::{Agent, AgentArgs};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// What a registry entry builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Agent,
    Model,
    DataModule,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agent => "agent",
            Self::Model => "model",
            Self::DataModule => "data module",
        })
    }
}

type Factory<A, T> = Box<dyn Fn(&A) -> crate::Result<T> + Send + Sync>;

/// Factories of one strategy kind, keyed by name.
pub struct Registry<A, T> {
    kind: StrategyKind,
    factories: BTreeMap<String, Factory<A, T>>,
}

impl<A, T> Registry<A, T> {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Register a factory. Fails if the name is already taken.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), StrategyError>
    where
        F: Fn(&A) -> crate::Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(StrategyError::AlreadyRegistered {
                kind: self.kind,
                name,
            });
        }
        debug!(kind = %self.kind, strategy = %name, "Registering strategy");
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Build the strategy registered under `name`. Factory errors are
    /// returned unchanged.
    pub fn resolve(&self, name: &str, args: &A) -> crate::Result<T> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StrategyError::Unknown {
                kind: self.kind,
                name: name.to_string(),
                valid: self.names(),
            })?;
        debug!(kind = %self.kind, strategy = %name, "Resolving strategy");
        factory(args)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<A, T> fmt::Debug for Registry<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

/// One registry per strategy kind.
#[derive(Debug)]
pub struct StrategyRegistry {
    pub agents: Registry<AgentArgs, Box<dyn Agent>>,
    pub models: Registry<StrategyArgs, Box<dyn Model>>,
    pub data_modules: Registry<StrategyArgs, Box<dyn DataModule>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: Registry::new(StrategyKind::Agent),
            models: Registry::new(StrategyKind::Model),
            data_modules: Registry::new(StrategyKind::DataModule),
        }
    }

    /// A registry holding every built-in strategy.
    pub fn with_builtins() -> Result<Self, StrategyError> {
        let mut registry = Self::new();
        crate::training::agent::register_builtins(&mut registry)?;
        crate::strategies::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Registered names of one kind.
    pub fn names(&self, kind: StrategyKind) -> Vec<String> {
        match kind {
            StrategyKind::Agent => self.agents.names(),
            StrategyKind::Model => self.models.names(),
            StrategyKind::DataModule => self.data_modules.names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SegrunError;

    fn numbers() -> Registry<u32, u32> {
        let mut registry = Registry::new(StrategyKind::Model);
        registry.register("double", |x: &u32| Ok(x * 2)).unwrap();
        registry.register("square", |x: &u32| Ok(x * x)).unwrap();
        registry
    }

    #[test]
    fn test_resolve_registered() {
        let registry = numbers();
        assert_eq!(registry.resolve("double", &4).unwrap(), 8);
        assert_eq!(registry.resolve("square", &4).unwrap(), 16);
        assert!(registry.contains("double"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resolve_unknown_lists_names() {
        let err = numbers().resolve("cube", &2).unwrap_err();
        match err {
            SegrunError::Strategy(StrategyError::Unknown { kind, name, valid }) => {
                assert_eq!(kind, StrategyKind::Model);
                assert_eq!(name, "cube");
                assert_eq!(valid, vec!["double".to_string(), "square".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = numbers();
        let err = registry.register("double", |x: &u32| Ok(*x)).unwrap_err();
        assert_eq!(
            err,
            StrategyError::AlreadyRegistered {
                kind: StrategyKind::Model,
                name: "double".into()
            }
        );
    }

    #[test]
    fn test_factory_errors_propagate() {
        let mut registry: Registry<u32, u32> = Registry::new(StrategyKind::DataModule);
        registry
            .register("broken", |_: &u32| Err(SegrunError::invalid_input("no data")))
            .unwrap();
        let err = registry.resolve("broken", &0).unwrap_err();
        assert!(matches!(err, SegrunError::InvalidInput(ref msg) if msg == "no data"));
    }

    #[test]
    fn test_unknown_message() {
        let err = StrategyError::Unknown {
            kind: StrategyKind::DataModule,
            name: "Foo".into(),
            valid: vec!["BarlowTwinsDataset".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown data module 'Foo', valid names: [BarlowTwinsDataset]"
        );
    }

    #[test]
    fn test_builtins() {
        let registry = StrategyRegistry::with_builtins().unwrap();
        assert_eq!(registry.names(StrategyKind::Agent), vec!["trainer"]);
        assert_eq!(
            registry.names(StrategyKind::Model),
            vec!["BarlowTwins", "Deeplabv3", "Dino", "SegNet"]
        );
        assert_eq!(
            registry.names(StrategyKind::DataModule),
            vec!["BarlowTwins", "Dino", "Segmentation"]
        );
    }
}
