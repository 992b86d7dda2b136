//! Dependency planner: turns a workflow's task graph into an ordered wave
//! schedule and rejects cycles.
//!
//! A task's wave is its longest-path depth from the roots: wave(t) =
//! 1 + max(wave(d)) over its dependencies, with isolated roots in wave 0.
//! Within a wave, tasks keep their declaration order so the schedule is
//! deterministic. Cycle detection runs first, with three-color depth-first
//! traversal so the error carries one concrete cycle path.

use std::collections::{HashMap, VecDeque};

use crate::error::EngineError;
use crate::expr::is_literal_always;
use crate::model::Workflow;

/// A set of tasks that become runnable together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    /// Task ids in declaration order.
    pub tasks: Vec<String>,
    /// True when every member's condition is literally `always()`. Such
    /// waves hold cleanup work that must run even after failure.
    pub always: bool,
}

/// The finite, ordered wave schedule for a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
}

impl ExecutionPlan {
    /// Wave index of a task, if it is planned.
    pub fn wave_of(&self, task_id: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|w| w.tasks.iter().any(|t| t == task_id))
    }
}

/// Build the execution plan for a validated workflow.
///
/// Unknown dependency ids are a validation-time error reported upstream;
/// the planner assumes the graph is closed and ignores them.
pub fn plan(workflow: &Workflow) -> Result<ExecutionPlan, EngineError> {
    detect_cycle(workflow)?;

    let n = workflow.tasks.len();
    let index: HashMap<&str, usize> = workflow
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];
    for (ti, task) in workflow.tasks.iter().enumerate() {
        for dep in &task.depends_on {
            if let Some(&di) = index.get(dep.as_str()) {
                dependents[di].push(ti);
                in_degree[ti] += 1;
            }
        }
    }

    // Kahn traversal computing longest-path depth. The queue is seeded in
    // declaration order; the max() update makes the result independent of
    // pop order anyway.
    let mut wave_of = vec![0usize; n];
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    while let Some(node) = queue.pop_front() {
        for &dependent in &dependents[node] {
            wave_of[dependent] = wave_of[dependent].max(wave_of[node] + 1);
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    let wave_count = wave_of.iter().copied().max().map_or(0, |m| m + 1);
    let mut buckets: Vec<Vec<String>> = vec![vec![]; wave_count];
    // Ascending task index keeps declaration order within each wave.
    for (ti, task) in workflow.tasks.iter().enumerate() {
        buckets[wave_of[ti]].push(task.id.clone());
    }

    let waves = buckets
        .into_iter()
        .map(|tasks| {
            let always = tasks.iter().all(|id| {
                workflow
                    .task(id)
                    .is_some_and(|t| is_literal_always(t.condition.as_deref()))
            });
            Wave { tasks, always }
        })
        .collect();

    Ok(ExecutionPlan { waves })
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS over `depends_on` edges. On hitting a gray node the
/// recursion stack is cut at that node to reconstruct the cycle path.
fn detect_cycle(workflow: &Workflow) -> Result<(), EngineError> {
    let index: HashMap<&str, usize> = workflow
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut colors = vec![Color::White; workflow.tasks.len()];
    let mut stack = Vec::new();

    for start in 0..workflow.tasks.len() {
        if colors[start] == Color::White {
            if let Some(cycle) = visit(start, workflow, &index, &mut colors, &mut stack) {
                let path = cycle
                    .iter()
                    .map(|&i| workflow.tasks[i].id.as_str())
                    .collect::<Vec<_>>()
                    .join(" → ");
                return Err(EngineError::CircularDependency { cycle: path });
            }
        }
    }
    Ok(())
}

fn visit(
    node: usize,
    workflow: &Workflow,
    index: &HashMap<&str, usize>,
    colors: &mut [Color],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    colors[node] = Color::Gray;
    stack.push(node);

    for dep in &workflow.tasks[node].depends_on {
        let Some(&di) = index.get(dep.as_str()) else {
            continue;
        };
        match colors[di] {
            Color::Gray => {
                let pos = stack.iter().position(|&x| x == di).unwrap_or(0);
                let mut cycle: Vec<usize> = stack[pos..].to_vec();
                cycle.push(di);
                return Some(cycle);
            }
            Color::White => {
                if let Some(cycle) = visit(di, workflow, index, colors, stack) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    stack.pop();
    colors[node] = Color::Black;
    None
}
