//! Integration tests for the expression engine: conditions, interpolation,
//! and registry extension evaluated against a populated run state.

use std::collections::HashMap;

use riptide_core::error::EngineError;
use riptide_core::expr::{
    EvalContext, FunctionRegistry, Value, eval_condition, eval_source, interpolate,
    is_literal_always,
};
use riptide_core::model::{ExecutionStatus, TaskOutput};
use riptide_core::state::{RunSnapshot, RunState};

// ===========================================================================
// Fixture: a run with one success, one failure, one pending task
// ===========================================================================

struct Fixture {
    snapshot: RunSnapshot,
    env: HashMap<String, String>,
    vars: HashMap<String, String>,
    registry: FunctionRegistry,
    deps: Vec<String>,
}

impl Fixture {
    fn new() -> Self {
        let state = RunState::new(["fetch", "lint", "publish"]);
        state.finish(
            "fetch",
            ExecutionStatus::Succeeded,
            Some(0),
            Some(TaskOutput::Stdout {
                stdout: "v2.4.1".to_string(),
                stderr: None,
            }),
            None,
            false,
        );
        state.finish(
            "lint",
            ExecutionStatus::Failed,
            Some(1),
            None,
            Some("exited with code 1".to_string()),
            true,
        );
        Self {
            snapshot: state.snapshot(),
            env: HashMap::from([
                ("TARGET".to_string(), "prod".to_string()),
                ("CHANNEL".to_string(), "stable".to_string()),
            ]),
            vars: HashMap::from([("region".to_string(), "eu-1".to_string())]),
            registry: FunctionRegistry::with_builtins(),
            deps: vec![],
        }
    }

    fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    fn ctx(&self) -> EvalContext<'_> {
        EvalContext {
            snapshot: &self.snapshot,
            depends_on: &self.deps,
            env: &self.env,
            vars: &self.vars,
            registry: &self.registry,
        }
    }
}

// ===========================================================================
// Condition surface
// ===========================================================================

#[test]
fn global_predicates_reflect_the_tainted_run() {
    let fixture = Fixture::new();
    // The lint failure counted against the run.
    assert!(!eval_condition("success()", &fixture.ctx()).unwrap());
    assert!(eval_condition("failure()", &fixture.ctx()).unwrap());
    assert!(eval_condition("always()", &fixture.ctx()).unwrap());
    assert!(!eval_condition("cancelled()", &fixture.ctx()).unwrap());
}

#[test]
fn scoped_predicates_only_see_declared_dependencies() {
    let on_fetch = Fixture::new().with_deps(&["fetch"]);
    assert!(eval_condition("success()", &on_fetch.ctx()).unwrap());
    assert!(!eval_condition("failure()", &on_fetch.ctx()).unwrap());

    let on_both = Fixture::new().with_deps(&["fetch", "lint"]);
    assert!(!eval_condition("success()", &on_both.ctx()).unwrap());
    assert!(eval_condition("failure()", &on_both.ctx()).unwrap());

    // A pending dependency is neither a success nor a failure.
    let on_pending = Fixture::new().with_deps(&["publish"]);
    assert!(!eval_condition("success()", &on_pending.ctx()).unwrap());
    assert!(!eval_condition("failure()", &on_pending.ctx()).unwrap());
}

#[test]
fn composition_with_predicates_and_registry_functions() {
    let fixture = Fixture::new().with_deps(&["fetch"]);
    let ctx = fixture.ctx();
    assert!(eval_condition("success() && eq(env.TARGET, 'prod')", &ctx).unwrap());
    assert!(eval_condition("failure() || startsWith(tasks.fetch.stdout, 'v2.')", &ctx).unwrap());
    assert!(
        eval_condition(
            "!(contains(env.CHANNEL, 'beta')) && matches(tasks.fetch.stdout, 'v[0-9.]+')",
            &ctx
        )
        .unwrap()
    );
}

#[test]
fn task_fields_resolve_through_the_snapshot() {
    let fixture = Fixture::new();
    let ctx = fixture.ctx();
    assert_eq!(
        eval_source("tasks.fetch.stdout", &ctx).unwrap(),
        Value::Str("v2.4.1".to_string())
    );
    assert_eq!(
        eval_source("tasks.lint.exit_code", &ctx).unwrap(),
        Value::Number(1.0)
    );
    assert_eq!(
        eval_source("tasks.publish.status", &ctx).unwrap(),
        Value::Str("pending".to_string())
    );
    assert_eq!(
        eval_source("vars.region", &ctx).unwrap(),
        Value::Str("eu-1".to_string())
    );
}

#[test]
fn unknown_names_error_and_carry_the_source() {
    let fixture = Fixture::new();
    let ctx = fixture.ctx();
    for source in [
        "tasks.ghost.stdout",
        "tasks.fetch.retries",
        "env.MISSING",
        "undeclared",
        "frobnicate()",
    ] {
        match eval_source(source, &ctx).unwrap_err() {
            EngineError::ExpressionEvaluation { expr, .. } => assert_eq!(expr, source),
            other => panic!("expected ExpressionEvaluation for `{source}`, got {other}"),
        }
    }
}

#[test]
fn parse_failures_surface_as_expression_errors() {
    let fixture = Fixture::new();
    let err = eval_condition("success( &&", &fixture.ctx()).unwrap_err();
    match err {
        EngineError::ExpressionEvaluation { expr, reason } => {
            assert_eq!(expr, "success( &&");
            assert!(reason.contains("parse error"));
        }
        other => panic!("expected ExpressionEvaluation, got {other}"),
    }
}

// ===========================================================================
// Interpolation surface
// ===========================================================================

#[test]
fn interpolation_renders_mixed_scopes() {
    let fixture = Fixture::new();
    let rendered = interpolate(
        "deploy ${{ tasks.fetch.stdout }} to ${{ env.TARGET }}/${{ vars.region }} \
         (lint exit ${{ tasks.lint.exit_code }})",
        &fixture.ctx(),
    )
    .unwrap();
    assert_eq!(rendered, "deploy v2.4.1 to prod/eu-1 (lint exit 1)");
}

#[test]
fn interpolation_never_substitutes_silently() {
    let fixture = Fixture::new();
    assert!(interpolate("echo ${{ env.MISSING }}", &fixture.ctx()).is_err());
    assert!(interpolate("echo ${{ env.TARGET", &fixture.ctx()).is_err());
    // Plain dollars and empty templates pass through untouched.
    assert_eq!(
        interpolate("cost $5 for ${USER}", &fixture.ctx()).unwrap(),
        "cost $5 for ${USER}"
    );
}

#[test]
fn interpolated_expressions_share_the_condition_grammar() {
    let fixture = Fixture::new().with_deps(&["fetch"]);
    let rendered = interpolate(
        "ok=${{ success() && eq(env.TARGET, 'prod') }}",
        &fixture.ctx(),
    )
    .unwrap();
    assert_eq!(rendered, "ok=true");
}

// ===========================================================================
// Registry extension
// ===========================================================================

#[test]
fn registered_predicates_are_callable_from_conditions() {
    let mut fixture = Fixture::new();
    fixture.registry.register("semverMajor", |args| match args {
        [v] => {
            let rendered = v.render();
            let major = rendered
                .trim_start_matches('v')
                .split('.')
                .next()
                .unwrap_or("")
                .to_string();
            Ok(Value::Str(major))
        }
        _ => Err("semverMajor() expects 1 argument".to_string()),
    });

    assert!(
        eval_condition("eq(semverMajor(tasks.fetch.stdout), '2')", &fixture.ctx()).unwrap()
    );
}

#[test]
fn registry_function_errors_fail_the_expression() {
    let fixture = Fixture::new();
    let err = eval_condition("matches(tasks.fetch.stdout, '(')", &fixture.ctx()).unwrap_err();
    match err {
        EngineError::ExpressionEvaluation { reason, .. } => {
            assert!(reason.contains("matches"));
        }
        other => panic!("expected ExpressionEvaluation, got {other}"),
    }
}

// ===========================================================================
// Literal-always detection (drives cleanup scheduling)
// ===========================================================================

#[test]
fn only_the_bare_always_call_is_literal() {
    assert!(is_literal_always(Some("always()")));
    assert!(is_literal_always(Some("\talways()\n")));
    for not_literal in [
        Some("always() && success()"),
        Some("!always()"),
        Some("success()"),
        None,
    ] {
        assert!(!is_literal_always(not_literal));
    }
}
