//! Code units and the loaders that resolve them.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::envelope::Rejection;
use crate::error::LoadError;
use crate::value::Value;

/// Future returned by a code unit.
pub type UnitFuture = BoxFuture<'static, Result<Value, Rejection>>;

/// A unit of code the worker can invoke.
///
/// Work done before `call` returns is the unit's synchronous part; a panic
/// there is reported like a synchronous throw. The returned future is the
/// asynchronous part.
pub trait CodeUnit: Send + Sync {
    fn call(&self, args: Vec<Value>) -> UnitFuture;
}

/// Resolves unit paths and preload modules inside the worker.
pub trait CodeUnitLoader: Send {
    /// Load an auxiliary module for its side effects.
    fn preload(&mut self, id: &str) -> Result<(), LoadError>;

    /// Resolve `path` to its exported callable.
    fn load(&mut self, path: &str) -> Result<Arc<dyn CodeUnit>, LoadError>;
}

/// Unit backed by an async closure.
pub struct AsyncFnUnit<F>(pub F);

impl<F, Fut> CodeUnit for AsyncFnUnit<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Rejection>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> UnitFuture {
        (self.0)(args).boxed()
    }
}

/// Unit backed by a plain closure; it runs entirely during `call`.
pub struct SyncFnUnit<F>(pub F);

impl<F> CodeUnit for SyncFnUnit<F>
where
    F: Fn(Vec<Value>) -> Result<Value, Rejection> + Send + Sync,
{
    fn call(&self, args: Vec<Value>) -> UnitFuture {
        let outcome = (self.0)(args);
        futures::future::ready(outcome).boxed()
    }
}
