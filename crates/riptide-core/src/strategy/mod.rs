//! Execution strategies: pluggable adapters that turn a logical task
//! command into a concrete child-process invocation.
//!
//! Selection walks the registered strategies in ascending priority order
//! and picks the first whose `can_handle` accepts the task. The built-in
//! set is SSH (10), container (20), local (100); local always handles, so
//! selection never comes up empty with the built-ins registered.

pub mod container;
pub mod local;
pub mod ssh;

pub use container::ContainerStrategy;
pub use local::LocalStrategy;
pub use ssh::SshStrategy;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{Task, Workflow};

/// A concrete child-process invocation produced by a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Variables set on the spawned process, merged over its inherited
    /// environment. For container/SSH the task environment travels in the
    /// argv instead; this map then only carries client-side variables such
    /// as `CONTAINER_HOST`.
    pub env: HashMap<String, String>,
}

/// Run-scoped inputs a strategy may consult while building a config.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub workflow: &'a Workflow,
    /// Ambient additional variables (CLI/run-time), layered between the
    /// workflow and task declarations.
    pub additional_env: &'a HashMap<String, String>,
    /// Fallback working directory when the task declares none.
    pub working_dir: Option<&'a Path>,
}

/// The two-method strategy contract plus a stable sort key.
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Ascending selection priority; lower wins.
    fn priority(&self) -> u32;

    /// Whether this strategy can execute the task given the workflow-level
    /// defaults.
    fn can_handle(&self, workflow: &Workflow, task: &Task) -> bool;

    /// Build the child-process invocation for an already-interpolated
    /// command string.
    fn build_config(
        &self,
        command: &str,
        task: &Task,
        ctx: &StrategyContext<'_>,
    ) -> Result<ExecutionConfig, EngineError>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ExecutionStrategy) {}
};

/// An ordered collection of strategies.
pub struct StrategySet {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
}

impl StrategySet {
    /// An empty set. Most callers want [`StrategySet::builtin`].
    pub fn new() -> Self {
        Self { strategies: vec![] }
    }

    /// The built-in SSH/container/local triple.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(SshStrategy));
        set.register(Arc::new(ContainerStrategy));
        set.register(Arc::new(LocalStrategy));
        set
    }

    /// Add a strategy, keeping the list sorted by ascending priority.
    /// The sort is stable, so equal priorities keep registration order.
    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.priority());
    }

    /// First strategy (lowest priority value) that can handle the task.
    pub fn select(&self, workflow: &Workflow, task: &Task) -> Option<&dyn ExecutionStrategy> {
        self.strategies
            .iter()
            .find(|s| s.can_handle(workflow, task))
            .map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for StrategySet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for StrategySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySet")
            .field("strategies", &self.names())
            .finish()
    }
}
