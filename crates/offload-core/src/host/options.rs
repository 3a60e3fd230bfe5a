//! Invoker configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How each worker is started.
///
/// All fields are optional when deserializing:
///
/// ```json
/// { "executable": "/usr/local/bin/offload-worker",
///   "extra_preload_modules": ["./hooks.so"],
///   "environment_overrides": { "MODE": "test" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerOptions {
    /// Worker binary; discovered when unset.
    pub executable: Option<PathBuf>,

    /// Modules the worker loads, in order, before the target.
    pub extra_preload_modules: Vec<String>,

    /// Variables set on top of the host environment for the worker.
    pub environment_overrides: BTreeMap<String, String>,
}

impl InvokerOptions {
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_preload(mut self, module: impl Into<String>) -> Self {
        self.extra_preload_modules.push(module.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }
}
