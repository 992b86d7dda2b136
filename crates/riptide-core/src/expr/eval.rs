//! Expression evaluation against the run state.

use std::collections::HashMap;

use super::registry::FunctionRegistry;
use super::{Expr, Value, parser};
use crate::error::EngineError;
use crate::state::RunSnapshot;

/// Everything an expression can see.
///
/// `depends_on` scopes `success()`/`failure()` to the owning task's declared
/// dependencies when non-empty; with no dependencies they consider the
/// global run. `env` holds the declared (workflow + additional + task)
/// variables; the ambient host environment is deliberately not exposed.
pub struct EvalContext<'a> {
    pub snapshot: &'a RunSnapshot,
    pub depends_on: &'a [String],
    pub env: &'a HashMap<String, String>,
    /// Open scope for ambient run-time variables (matrix values, CLI `--env`).
    pub vars: &'a HashMap<String, String>,
    pub registry: &'a FunctionRegistry,
}

/// Evaluate a condition source string to a boolean.
pub fn eval_condition(source: &str, ctx: &EvalContext<'_>) -> Result<bool, EngineError> {
    eval_source(source, ctx).map(|v| v.truthy())
}

/// Parse and evaluate a source string to a [`Value`].
pub fn eval_source(source: &str, ctx: &EvalContext<'_>) -> Result<Value, EngineError> {
    let expr = parser::parse(source)?;
    eval_expr(&expr, ctx).map_err(|reason| EngineError::ExpressionEvaluation {
        expr: source.to_string(),
        reason,
    })
}

/// Whether a task's condition source is literally `always()`. Such tasks are
/// scheduled for cleanup waves and get lenient condition-error handling.
pub fn is_literal_always(condition: Option<&str>) -> bool {
    condition.is_some_and(|c| c.trim() == "always()")
}

/// Replace every `${{ <expr> }}` region in `template` with its evaluated,
/// rendered value. Unknown identifiers are a hard error, never an empty
/// substitution.
pub fn interpolate(template: &str, ctx: &EvalContext<'_>) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            return Err(EngineError::ExpressionEvaluation {
                expr: template.to_string(),
                reason: "unterminated `${{` interpolation".to_string(),
            });
        };
        let value = eval_source(&after[..end], ctx)?;
        out.push_str(&value.render());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_expr(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(path) => resolve_ident(path, ctx),
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, ctx)?.truthy())),
        Expr::And(lhs, rhs) => {
            if !eval_expr(lhs, ctx)?.truthy() {
                Ok(Value::Bool(false))
            } else {
                Ok(Value::Bool(eval_expr(rhs, ctx)?.truthy()))
            }
        }
        Expr::Or(lhs, rhs) => {
            if eval_expr(lhs, ctx)?.truthy() {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(eval_expr(rhs, ctx)?.truthy()))
            }
        }
        Expr::Call { name, args } => eval_call(name, args, ctx),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<Value, String> {
    // Run predicates take no arguments; with a non-empty depends_on they are
    // scoped to the owning task's dependencies.
    match name {
        "success" => {
            expect_no_args(name, args)?;
            let ok = if ctx.depends_on.is_empty() {
                ctx.snapshot.all_succeeded()
            } else {
                ctx.snapshot.dependencies_succeeded(ctx.depends_on)
            };
            return Ok(Value::Bool(ok));
        }
        "failure" => {
            expect_no_args(name, args)?;
            let failed = if ctx.depends_on.is_empty() {
                ctx.snapshot.has_failure()
            } else {
                ctx.snapshot.dependencies_failed(ctx.depends_on)
            };
            return Ok(Value::Bool(failed));
        }
        "always" => {
            expect_no_args(name, args)?;
            return Ok(Value::Bool(true));
        }
        "cancelled" => {
            expect_no_args(name, args)?;
            return Ok(Value::Bool(ctx.snapshot.is_run_cancelled()));
        }
        _ => {}
    }

    let f = ctx
        .registry
        .get(name)
        .ok_or_else(|| format!("unknown function `{name}`"))?;
    let values = args
        .iter()
        .map(|a| eval_expr(a, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    f(&values)
}

fn expect_no_args(name: &str, args: &[Expr]) -> Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!("{name}() takes no arguments"))
    }
}

fn resolve_ident(path: &str, ctx: &EvalContext<'_>) -> Result<Value, String> {
    let parts: Vec<&str> = path.split('.').collect();
    match parts.as_slice() {
        ["env", key] => ctx
            .env
            .get(*key)
            .map(|v| Value::Str(v.clone()))
            .ok_or_else(|| format!("unknown environment variable `{key}`")),
        ["vars" | "matrix", key] => ctx
            .vars
            .get(*key)
            .map(|v| Value::Str(v.clone()))
            .ok_or_else(|| format!("unknown variable `{key}`")),
        ["tasks", id, field] => {
            let record = ctx
                .snapshot
                .records
                .get(*id)
                .ok_or_else(|| format!("unknown task `{id}`"))?;
            match *field {
                "stdout" => ctx
                    .snapshot
                    .stdout_of(id)
                    .map(|s| Value::Str(s.to_string()))
                    .ok_or_else(|| format!("task `{id}` has no captured stdout")),
                "exit_code" => record
                    .exit_code
                    .map(|c| Value::Number(c as f64))
                    .ok_or_else(|| format!("task `{id}` has no exit code")),
                "status" => Ok(Value::Str(record.status.to_string())),
                other => Err(format!("unknown task field `{other}`")),
            }
        }
        [key] => ctx
            .env
            .get(*key)
            .or_else(|| ctx.vars.get(*key))
            .map(|v| Value::Str(v.clone()))
            .ok_or_else(|| format!("unknown identifier `{key}`")),
        _ => Err(format!("unknown identifier `{path}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, TaskOutput};
    use crate::state::RunState;

    struct Fixture {
        snapshot: RunSnapshot,
        env: HashMap<String, String>,
        vars: HashMap<String, String>,
        registry: FunctionRegistry,
        deps: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let state = RunState::new(["build", "test", "deploy"]);
            state.finish(
                "build",
                ExecutionStatus::Succeeded,
                Some(0),
                Some(TaskOutput::Stdout {
                    stdout: "artifact-42".to_string(),
                    stderr: None,
                }),
                None,
                false,
            );
            Self {
                snapshot: state.snapshot(),
                env: HashMap::from([("TARGET".to_string(), "prod".to_string())]),
                vars: HashMap::new(),
                registry: FunctionRegistry::with_builtins(),
                deps: vec![],
            }
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

    #[test]
    fn success_considers_global_run_without_deps() {
        let fixture = Fixture::new();
        assert!(eval_condition("success()", &fixture.ctx()).unwrap());
        assert!(!eval_condition("failure()", &fixture.ctx()).unwrap());
    }

    #[test]
    fn success_scopes_to_dependencies() {
        let mut fixture = Fixture::new();
        fixture.deps = vec!["build".to_string()];
        assert!(eval_condition("success()", &fixture.ctx()).unwrap());

        // An unfinished dependency is not a success.
        fixture.deps = vec!["test".to_string()];
        assert!(!eval_condition("success()", &fixture.ctx()).unwrap());
    }

    #[test]
    fn failure_scopes_to_dependencies() {
        let fixture = Fixture::new();
        let state = RunState::new(["build"]);
        state.finish("build", ExecutionStatus::Failed, Some(1), None, None, true);
        let snapshot = state.snapshot();
        let deps = vec!["build".to_string()];
        let ctx = EvalContext {
            snapshot: &snapshot,
            depends_on: &deps,
            env: &fixture.env,
            vars: &fixture.vars,
            registry: &fixture.registry,
        };
        assert!(eval_condition("failure()", &ctx).unwrap());
        assert!(!eval_condition("success()", &ctx).unwrap());
    }

    #[test]
    fn always_is_constant_true() {
        let fixture = Fixture::new();
        assert!(eval_condition("always()", &fixture.ctx()).unwrap());
    }

    #[test]
    fn cancelled_reflects_run_flag() {
        let fixture = Fixture::new();
        assert!(!eval_condition("cancelled()", &fixture.ctx()).unwrap());

        let state = RunState::new(["a"]);
        state.mark_run_cancelled();
        let snapshot = state.snapshot();
        let ctx = EvalContext {
            snapshot: &snapshot,
            depends_on: &[],
            env: &fixture.env,
            vars: &fixture.vars,
            registry: &fixture.registry,
        };
        assert!(eval_condition("cancelled()", &ctx).unwrap());
    }

    #[test]
    fn predicates_reject_arguments() {
        let fixture = Fixture::new();
        assert!(eval_condition("always(1)", &fixture.ctx()).is_err());
    }

    #[test]
    fn task_fields_resolve() {
        let fixture = Fixture::new();
        let ctx = fixture.ctx();
        assert_eq!(
            eval_source("tasks.build.stdout", &ctx).unwrap(),
            Value::Str("artifact-42".to_string())
        );
        assert_eq!(
            eval_source("tasks.build.exit_code", &ctx).unwrap(),
            Value::Number(0.0)
        );
        assert_eq!(
            eval_source("tasks.build.status", &ctx).unwrap(),
            Value::Str("succeeded".to_string())
        );
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let fixture = Fixture::new();
        let err = eval_source("tasks.missing.stdout", &fixture.ctx()).unwrap_err();
        match err {
            EngineError::ExpressionEvaluation { expr, reason } => {
                assert_eq!(expr, "tasks.missing.stdout");
                assert!(reason.contains("missing"));
            }
            other => panic!("expected ExpressionEvaluation, got {other}"),
        }
        assert!(eval_source("nonexistent", &fixture.ctx()).is_err());
    }

    #[test]
    fn env_and_predicate_composition() {
        let fixture = Fixture::new();
        assert!(eval_condition("eq(env.TARGET, 'prod') && success()", &fixture.ctx()).unwrap());
        assert!(!eval_condition("eq(env.TARGET, 'staging')", &fixture.ctx()).unwrap());
        assert!(eval_condition("!eq(env.TARGET, 'staging')", &fixture.ctx()).unwrap());
    }

    #[test]
    fn short_circuit_skips_rhs_errors() {
        let fixture = Fixture::new();
        // The unknown identifier on the right is never evaluated.
        assert!(eval_condition("always() || nonexistent", &fixture.ctx()).unwrap());
        assert!(!eval_condition("failure() && nonexistent", &fixture.ctx()).unwrap());
    }

    #[test]
    fn interpolation_substitutes_values() {
        let fixture = Fixture::new();
        let out = interpolate(
            "deploy ${{ tasks.build.stdout }} to ${{ env.TARGET }}",
            &fixture.ctx(),
        )
        .unwrap();
        assert_eq!(out, "deploy artifact-42 to prod");
    }

    #[test]
    fn interpolation_without_markers_is_identity() {
        let fixture = Fixture::new();
        assert_eq!(
            interpolate("plain command", &fixture.ctx()).unwrap(),
            "plain command"
        );
        // A bare dollar is not an interpolation.
        assert_eq!(interpolate("cost $5", &fixture.ctx()).unwrap(), "cost $5");
    }

    #[test]
    fn interpolation_unknown_identifier_fails() {
        let fixture = Fixture::new();
        assert!(interpolate("echo ${{ nope }}", &fixture.ctx()).is_err());
    }

    #[test]
    fn interpolation_unterminated_fails() {
        let fixture = Fixture::new();
        let err = interpolate("echo ${{ env.TARGET", &fixture.ctx()).unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn literal_always_detection() {
        assert!(is_literal_always(Some("always()")));
        assert!(is_literal_always(Some("  always()  ")));
        assert!(!is_literal_always(Some("always() || success()")));
        assert!(!is_literal_always(Some("success()")));
        assert!(!is_literal_always(None));
    }
}
