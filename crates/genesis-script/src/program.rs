//! Compilation of validated sources into loadable trait programs.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;

use crate::ast::{Expr, FnDef, Item, Module, TraitDef, UnaryOp};
use crate::interp::{ExecBudget, ExecError, Interp, ScriptState, TraitHost, Value};
use crate::validator::{self, FailureCode, ValidationReport};
use crate::{interp, parser};

/// Errors surfaced while turning source text into a [`TraitProgram`].
#[derive(Debug, Error)]
pub enum CompileError {
    /// The source failed static validation; the report carries the code.
    #[error("validation rejected: {}", .0.error.as_deref().unwrap_or("unknown"))]
    Rejected(ValidationReport),
    #[error("line {line}: unknown module function '{module}::{function}'")]
    UnknownModuleFunction {
        module: String,
        function: String,
        line: u32,
    },
    #[error("line {line}: '{function}' expects {min}..={max} arguments, got {got}")]
    BadArity {
        function: String,
        min: usize,
        max: usize,
        got: usize,
        line: u32,
    },
    #[error("line {line}: unknown function '{function}'")]
    UnknownFunction { function: String, line: u32 },
    #[error("line {line}: unknown trait member 'self.{method}'")]
    UnknownMember { method: String, line: u32 },
}

impl CompileError {
    /// The taxonomy code an operator sees for this failure.
    #[must_use]
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::Rejected(report) => report.failure.unwrap_or(FailureCode::LoadFailed),
            _ => FailureCode::LoadFailed,
        }
    }
}

/// A compiled, immutable trait behaviour. Programs are shared via `Arc`
/// between the registry, the engine thread and inspection surfaces.
#[derive(Debug, Clone)]
pub struct TraitProgram {
    name: String,
    init: Option<FnDef>,
    members: Vec<FnDef>,
    consts: HashMap<String, Value>,
}

impl TraitProgram {
    /// Trait block name, e.g. `FoodSeeker`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `init()` (if present) to produce the per-instance state.
    pub fn instantiate(&self, rng: &mut dyn RngCore) -> Result<ScriptState, ExecError> {
        let mut state = ScriptState::new();
        if let Some(init) = &self.init {
            let mut budget = ExecBudget::ops_only(10_000);
            let mut host = interp::NoEntity;
            let mut interp =
                Interp::new(&mut host, &mut state, rng, &mut budget, &self.consts, &self.members);
            interp.run_fn(init, Vec::new())?;
        }
        Ok(state)
    }

    /// Run `execute(entity)` against a host under the provided budget.
    pub fn execute(
        &self,
        host: &mut dyn TraitHost,
        state: &mut ScriptState,
        rng: &mut dyn RngCore,
        budget: &mut ExecBudget,
    ) -> Result<(), ExecError> {
        let execute = self
            .members
            .iter()
            .find(|f| f.name == "execute")
            .ok_or_else(|| ExecError::UnknownFunction("execute".into()))?;
        let mut interp = Interp::new(host, state, rng, budget, &self.consts, &self.members);
        interp.run_fn(execute, vec![Value::Entity])?;
        Ok(())
    }
}

/// Default per-invocation budget matching the 5 ms trait deadline.
#[must_use]
pub fn default_budget(wall: Duration) -> ExecBudget {
    ExecBudget::new(wall, 200_000)
}

/// Compile a source text: validate, then resolve every call site.
///
/// Resolution failures that static validation cannot see (an unknown module
/// function, a call to a missing member) surface here, at load time, the way
/// a dynamic import error would.
pub fn compile(source: &str) -> Result<TraitProgram, CompileError> {
    compile_with(source, validator::DEFAULT_ALLOWED_IMPORTS)
}

/// [`compile`] with an explicit import allow-list.
pub fn compile_with(
    source: &str,
    allowed_imports: &[&str],
) -> Result<TraitProgram, CompileError> {
    let report = validator::validate_source_with(source, allowed_imports);
    if !report.accepted {
        return Err(CompileError::Rejected(report));
    }
    // The validator accepted, so this parse cannot fail.
    let module = parser::parse(source).map_err(|_| CompileError::Rejected(report))?;

    let mut imports = HashSet::new();
    let mut consts = HashMap::new();
    let mut def: Option<TraitDef> = None;
    for item in module.items {
        match item {
            Item::Use { module, .. } => {
                imports.insert(module);
            }
            Item::Const { name, value, .. } => {
                consts.insert(name, const_value(&value));
            }
            Item::Trait(t) => def = Some(t),
            Item::Stray { .. } => {}
        }
    }
    let def = def.expect("validator guarantees one trait block");

    resolve_calls(&def, &imports, &module_of(&def))?;

    Ok(TraitProgram {
        name: def.name.clone(),
        init: def.init.clone(),
        members: def.members,
        consts,
    })
}

fn module_of(def: &TraitDef) -> HashSet<String> {
    def.members.iter().map(|f| f.name.clone()).collect()
}

fn const_value(expr: &Expr) -> Value {
    match expr {
        Expr::Number(n) => Value::Num(*n),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Unary { op: UnaryOp::Neg, operand } => match const_value(operand) {
            Value::Num(n) => Value::Num(-n),
            other => other,
        },
        _ => Value::Unit,
    }
}

fn resolve_calls(
    def: &TraitDef,
    imports: &HashSet<String>,
    member_names: &HashSet<String>,
) -> Result<(), CompileError> {
    let mut error = None;
    let mut check = |expr: &Expr| {
        if error.is_some() {
            return;
        }
        match expr {
            Expr::ModuleCall { module, function, args, line } => {
                if !imports.contains(module) {
                    error = Some(CompileError::UnknownFunction {
                        function: format!("{module}::{function} (module not imported)"),
                        line: *line,
                    });
                    return;
                }
                match interp::module_signature(module, function) {
                    Some((min, max)) => {
                        if args.len() < min || args.len() > max {
                            error = Some(CompileError::BadArity {
                                function: format!("{module}::{function}"),
                                min,
                                max,
                                got: args.len(),
                                line: *line,
                            });
                        }
                    }
                    None => {
                        error = Some(CompileError::UnknownModuleFunction {
                            module: module.clone(),
                            function: function.clone(),
                            line: *line,
                        });
                    }
                }
            }
            Expr::SelfCall { method, line, .. } => {
                if !member_names.contains(method) {
                    error = Some(CompileError::UnknownMember {
                        method: method.clone(),
                        line: *line,
                    });
                }
            }
            Expr::BareCall { function, line, .. } => {
                error = Some(CompileError::UnknownFunction {
                    function: function.clone(),
                    line: *line,
                });
            }
            _ => {}
        }
    };
    visit_trait_exprs(def, &mut check);
    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn visit_trait_exprs(def: &TraitDef, visit: &mut dyn FnMut(&Expr)) {
    use crate::ast::Stmt;
    fn walk_stmt(stmt: &Stmt, visit: &mut dyn FnMut(&Expr)) {
        match stmt {
            Stmt::Let { value, .. } | Stmt::Assign { value, .. } => walk_expr(value, visit),
            Stmt::Expr(expr) => walk_expr(expr, visit),
            Stmt::If { condition, then_body, else_body } => {
                walk_expr(condition, visit);
                for s in then_body.iter().chain(else_body) {
                    walk_stmt(s, visit);
                }
            }
            Stmt::ForRange { start, end, body, .. } => {
                walk_expr(start, visit);
                walk_expr(end, visit);
                for s in body {
                    walk_stmt(s, visit);
                }
            }
            Stmt::ForEach { iterable, body, .. } => {
                walk_expr(iterable, visit);
                for s in body {
                    walk_stmt(s, visit);
                }
            }
            Stmt::Return(Some(expr)) => walk_expr(expr, visit),
            _ => {}
        }
    }
    fn walk_expr(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
        visit(expr);
        match expr {
            Expr::Unary { operand, .. } => walk_expr(operand, visit),
            Expr::Binary { left, right, .. } => {
                walk_expr(left, visit);
                walk_expr(right, visit);
            }
            Expr::Field { object, .. } => walk_expr(object, visit),
            Expr::ModuleCall { args, .. }
            | Expr::SelfCall { args, .. }
            | Expr::BareCall { args, .. } => {
                for arg in args {
                    walk_expr(arg, visit);
                }
            }
            Expr::MethodCall { object, args, .. } => {
                walk_expr(object, visit);
                for arg in args {
                    walk_expr(arg, visit);
                }
            }
            _ => {}
        }
    }
    if let Some(init) = &def.init {
        for stmt in &init.body {
            walk_stmt(stmt, visit);
        }
    }
    for member in &def.members {
        for stmt in &member.body {
            walk_stmt(stmt, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::time::Duration;

    /// Test host with a couple of numeric attributes and recorded moves.
    struct FakeEntity {
        energy: f64,
        x: f64,
        y: f64,
        moves: Vec<(f64, f64)>,
    }

    impl TraitHost for FakeEntity {
        fn get_attr(&self, name: &str) -> Result<Value, ExecError> {
            match name {
                "energy" => Ok(Value::Num(self.energy)),
                "max_energy" => Ok(Value::Num(100.0)),
                "x" => Ok(Value::Num(self.x)),
                "y" => Ok(Value::Num(self.y)),
                "nearby_resources" => Ok(Value::List(std::sync::Arc::new(vec![
                    Value::Resource(interp::ResourceView { slot: 7, x: 5.0, y: 5.0, amount: 40.0 }),
                ]))),
                "nearby_entities" => Ok(Value::List(std::sync::Arc::new(
                    (0..150)
                        .map(|n| {
                            Value::Neighbor(interp::NeighborView {
                                x: n as f32,
                                y: 0.0,
                                energy: 50.0,
                                radius: 6.0,
                                predator: false,
                                infected: false,
                            })
                        })
                        .collect(),
                ))),
                other => Err(ExecError::UnknownAttr(other.to_string())),
            }
        }

        fn set_attr(&mut self, name: &str, value: Value) -> Result<(), ExecError> {
            match name {
                "energy" => self.energy = value.as_num()?,
                "x" => self.x = value.as_num()?,
                "y" => self.y = value.as_num()?,
                other => return Err(ExecError::UnknownAttr(other.to_string())),
            }
            Ok(())
        }

        fn call_method(&mut self, name: &str, args: &[Value]) -> Result<Value, ExecError> {
            match name {
                "move" => {
                    self.moves.push((args[0].as_num()?, args[1].as_num()?));
                    Ok(Value::Unit)
                }
                "consume_resource" => {
                    self.energy += 40.0;
                    Ok(Value::Unit)
                }
                other => Err(ExecError::UnknownFunction(other.to_string())),
            }
        }
    }

    fn fake() -> FakeEntity {
        FakeEntity { energy: 10.0, x: 0.0, y: 0.0, moves: Vec::new() }
    }

    fn run(source: &str, host: &mut FakeEntity) -> Result<(), ExecError> {
        let program = compile(source).expect("compile");
        let mut rng = SmallRng::seed_from_u64(7);
        let mut state = program.instantiate(&mut rng).expect("init");
        let mut budget = ExecBudget::new(Duration::from_millis(50), 200_000);
        program.execute(host, &mut state, &mut rng, &mut budget)
    }

    #[test]
    fn executes_a_simple_energy_trait() {
        let mut host = fake();
        run(
            "trait Boost { fn execute(entity) { entity.energy += 1; } }",
            &mut host,
        )
        .expect("run");
        assert!((host.energy - 11.0).abs() < f64::EPSILON);
    }

    #[test]
    fn init_state_persists_between_fields_and_members() {
        let mut host = fake();
        run(
            r#"
trait Saver {
    init() {
        self.threshold = 50;
    }
    fn execute(entity) {
        if entity.energy < self.threshold {
            self.topup(entity);
        }
    }
    fn topup(entity) {
        entity.energy = self.threshold;
    }
}
"#,
            &mut host,
        )
        .expect("run");
        assert!((host.energy - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn iterates_nearby_resources_and_consumes() {
        let mut host = fake();
        run(
            r#"
trait Eater {
    fn execute(entity) {
        for r in entity.nearby_resources {
            entity.move(r.x - entity.x, r.y - entity.y);
            entity.consume_resource(r);
            break;
        }
    }
}
"#,
            &mut host,
        )
        .expect("run");
        assert_eq!(host.moves, vec![(5.0, 5.0)]);
        assert!((host.energy - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn range_loops_are_capped() {
        let mut host = fake();
        let err = run(
            "trait Spin { fn execute(entity) { for i in 0..5000 { entity.energy += 1; } } }",
            &mut host,
        )
        .unwrap_err();
        assert_eq!(err, ExecError::LoopLimit);
    }

    #[test]
    fn list_loops_are_capped_too() {
        let mut host = fake();
        let err = run(
            "trait Count { fn execute(entity) { for n in entity.nearby_entities { entity.energy += 0; } } }",
            &mut host,
        )
        .unwrap_err();
        assert_eq!(err, ExecError::LoopLimit);
    }

    #[test]
    fn op_budget_stops_runaway_nesting() {
        let mut host = fake();
        let program = compile(
            r#"
trait Grind {
    fn execute(entity) {
        let acc = 0;
        for i in 0..100 {
            for j in 0..100 {
                for k in 0..100 {
                    acc += math::sqrt(1.0);
                }
            }
        }
    }
}
"#,
        );
        // No `use math;` means compilation fails at resolution.
        assert!(program.is_err());

        let program = compile(
            r#"
use math;
trait Grind {
    fn execute(entity) {
        let acc = 0;
        for i in 0..100 {
            for j in 0..100 {
                for k in 0..100 {
                    acc += math::sqrt(1.0);
                }
            }
        }
    }
}
"#,
        )
        .expect("compile");
        let mut rng = SmallRng::seed_from_u64(1);
        let mut state = program.instantiate(&mut rng).expect("init");
        let mut budget = ExecBudget::ops_only(5_000);
        let err = program
            .execute(&mut host, &mut state, &mut rng, &mut budget)
            .unwrap_err();
        assert_eq!(err, ExecError::BudgetExhausted);
    }

    #[test]
    fn compile_fails_on_unknown_module_function() {
        let err = compile(
            "use math;\ntrait T { fn execute(entity) { let a = math::mystery(1); } }",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownModuleFunction { .. }));
        assert_eq!(err.failure_code(), FailureCode::LoadFailed);
    }

    #[test]
    fn compile_fails_on_unknown_member() {
        let err = compile(
            "trait T { fn execute(entity) { self.missing(entity); } }",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownMember { .. }));
    }

    #[test]
    fn compile_surfaces_validation_codes() {
        let err = compile("use os;\ntrait T { fn execute(entity) { } }").unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::ImportForbidden);
    }

    #[test]
    fn random_module_is_deterministic_under_a_seed() {
        let source = r#"
use random;
trait Wander {
    fn execute(entity) {
        entity.move(random::range(-1.0, 1.0), random::range(-1.0, 1.0));
    }
}
"#;
        let program = compile(source).expect("compile");
        let mut runs = Vec::new();
        for _ in 0..2 {
            let mut host = fake();
            let mut rng = SmallRng::seed_from_u64(42);
            let mut state = program.instantiate(&mut rng).expect("init");
            let mut budget = ExecBudget::ops_only(10_000);
            program
                .execute(&mut host, &mut state, &mut rng, &mut budget)
                .expect("run");
            runs.push(host.moves.clone());
        }
        assert_eq!(runs[0], runs[1]);
    }
}
