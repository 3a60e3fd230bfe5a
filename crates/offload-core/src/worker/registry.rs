//! Units linked into the worker binary, looked up by name.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::envelope::{ErrorValue, Rejection};
use crate::error::LoadError;
use crate::value::Value;

use super::unit::{AsyncFnUnit, CodeUnit, CodeUnitLoader, SyncFnUnit};

type Factory = Box<dyn Fn() -> Result<Arc<dyn CodeUnit>, ErrorValue> + Send>;
type PreloadHook = Box<dyn FnMut() -> Result<(), ErrorValue> + Send>;

/// Static registry of unit factories and preload hooks.
///
/// A factory runs when its unit is loaded; a factory error plays the role
/// of a unit whose initialization throws.
#[derive(Default)]
pub struct UnitRegistry {
    units: BTreeMap<String, Factory>,
    hooks: BTreeMap<String, PreloadHook>,
    preloaded: Vec<String>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async unit.
    pub fn unit<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Rejection>> + Send + 'static,
    {
        let unit: Arc<dyn CodeUnit> = Arc::new(AsyncFnUnit(f));
        self.factory(name, move || Ok(unit.clone()))
    }

    /// Register a unit that completes during the call.
    pub fn sync_unit<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Rejection> + Send + Sync + 'static,
    {
        let unit: Arc<dyn CodeUnit> = Arc::new(SyncFnUnit(f));
        self.factory(name, move || Ok(unit.clone()))
    }

    /// Register a factory that builds the unit on load.
    pub fn factory<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CodeUnit>, ErrorValue> + Send + 'static,
    {
        self.units.insert(name.into(), Box::new(f));
        self
    }

    /// Register a module that can be preloaded for its side effects.
    pub fn preload_hook<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnMut() -> Result<(), ErrorValue> + Send + 'static,
    {
        self.hooks.insert(name.into(), Box::new(f));
        self
    }

    /// Preload modules run so far, in order.
    pub fn preloaded(&self) -> &[String] {
        &self.preloaded
    }
}

impl CodeUnitLoader for UnitRegistry {
    fn preload(&mut self, id: &str) -> Result<(), LoadError> {
        let hook = self
            .hooks
            .get_mut(id)
            .ok_or_else(|| LoadError::NotFound(id.to_string()))?;
        hook().map_err(|error| LoadError::Init {
            path: id.to_string(),
            error,
        })?;
        self.preloaded.push(id.to_string());
        Ok(())
    }

    fn load(&mut self, path: &str) -> Result<Arc<dyn CodeUnit>, LoadError> {
        let factory = self
            .units
            .get(path)
            .ok_or_else(|| LoadError::NotFound(path.to_string()))?;
        factory().map_err(|error| LoadError::Init {
            path: path.to_string(),
            error,
        })
    }
}
