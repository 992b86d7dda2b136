//! Environment resolution.
//!
//! The host environment is read once per process and cached; after that it
//! is treated as immutable for the run. Layering, last writer wins per key:
//!
//! ```text
//! local backend:      host < workflow < additional < task
//! container / ssh:           workflow < additional < task
//! ```
//!
//! The host layer is omitted for container and SSH backends so host
//! variables never leak onto a remote side.

use std::collections::HashMap;
use std::sync::OnceLock;

static HOST_ENV: OnceLock<HashMap<String, String>> = OnceLock::new();

/// The process environment, read once and cached.
pub fn host_env() -> &'static HashMap<String, String> {
    HOST_ENV.get_or_init(|| std::env::vars().collect())
}

/// The declared layers stacked on top of the (optional) host environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvLayers<'a> {
    pub workflow: &'a HashMap<String, String>,
    /// Run-time additions (CLI `--env`, embedder-supplied).
    pub additional: &'a HashMap<String, String>,
    pub task: &'a HashMap<String, String>,
}

impl<'a> EnvLayers<'a> {
    /// Merged environment for the local backend: full host environment
    /// underneath the declared layers.
    pub fn resolve_local(&self) -> HashMap<String, String> {
        self.resolve_over(host_env())
    }

    /// Merged environment for container/SSH backends: declared layers only.
    pub fn resolve_isolated(&self) -> HashMap<String, String> {
        self.resolve_over(&HashMap::new())
    }

    fn resolve_over(&self, base: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = base.clone();
        for layer in [self.workflow, self.additional, self.task] {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}
