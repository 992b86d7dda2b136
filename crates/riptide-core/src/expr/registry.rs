//! Open registry of expression functions.
//!
//! The built-in run predicates (`success`, `failure`, `always`, `cancelled`)
//! are handled directly by the evaluator; everything else is looked up here.
//! Registrations are process-local and additive: embedders can add their own
//! predicates without touching the engine.

use std::collections::HashMap;
use std::sync::Arc;

use super::Value;

/// Signature of a registered function. Errors are plain reason strings; the
/// evaluator attaches the source expression.
pub type RegistryFn = dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync;

/// Name-keyed collection of expression functions.
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<RegistryFn>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Create a registry seeded with the string predicates `eq`,
    /// `startsWith`, `contains`, and `matches`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("eq", |args| {
            let (a, b) = two_strings("eq", args)?;
            Ok(Value::Bool(a == b))
        });
        registry.register("startsWith", |args| {
            let (haystack, prefix) = two_strings("startsWith", args)?;
            Ok(Value::Bool(haystack.starts_with(&prefix)))
        });
        registry.register("contains", |args| {
            let (haystack, needle) = two_strings("contains", args)?;
            Ok(Value::Bool(haystack.contains(&needle)))
        });
        registry.register("matches", |args| {
            let (haystack, pattern) = two_strings("matches", args)?;
            let re = regex::Regex::new(&pattern)
                .map_err(|e| format!("invalid pattern for matches(): {e}"))?;
            Ok(Value::Bool(re.is_match(&haystack)))
        });
        registry
    }

    /// Register a function. An existing function with the same name is
    /// replaced and returned.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Option<Arc<RegistryFn>> {
        self.functions.insert(name.into(), Arc::new(f))
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&Arc<RegistryFn>> {
        self.functions.get(name)
    }

    /// Sorted names of all registered functions.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

fn two_strings(name: &str, args: &[Value]) -> Result<(String, String), String> {
    match args {
        [a, b] => Ok((a.render(), b.render())),
        _ => Err(format!("{name}() expects 2 arguments, got {}", args.len())),
    }
}
