//! Budgeted tree-walking interpreter for compiled GeneScript traits.
//!
//! The interpreter reaches the world only through the [`TraitHost`]
//! capability surface, so a trait can never name ambient authority (files,
//! sockets, clocks). CPU is bounded two ways: an operation budget charged on
//! every evaluation step, and a wall-clock deadline checked periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use thiserror::Error;

use crate::ast::{AssignOp, AssignTarget, BinaryOp, Expr, FnDef, Stmt, UnaryOp};

/// Hard cap on `for i in a..b` iterations, per loop entry.
pub const LOOP_ITERATION_LIMIT: u64 = 100;

/// Nested `self.helper()` call depth limit.
const MAX_CALL_DEPTH: u32 = 16;

/// How often the wall-clock deadline is consulted, in charged operations.
const DEADLINE_CHECK_INTERVAL: u32 = 256;

/// Runtime faults raised by trait execution. All of them are local to the
/// offending trait: the executor records the fault and deactivates the trait
/// on its host entity.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    #[error("execution budget exhausted")]
    BudgetExhausted,
    #[error("loop exceeded {LOOP_ITERATION_LIMIT} iterations")]
    LoopLimit,
    #[error("call depth exceeded")]
    CallDepth,
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("unknown attribute '{0}'")]
    UnknownAttr(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("'{function}' expects {expected} arguments, got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("type error: expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0}")]
    Host(String),
}

/// A resource as seen by trait code. `slot` round-trips to the environment
/// so `consume_resource` can name the exact resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceView {
    pub slot: u64,
    pub x: f32,
    pub y: f32,
    pub amount: f32,
}

/// A read-only view of a nearby entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborView {
    pub x: f32,
    pub y: f32,
    pub energy: f32,
    pub radius: f32,
    pub predator: bool,
    pub infected: bool,
}

/// Values flowing through the interpreter.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Num(f64),
    Bool(bool),
    Str(String),
    List(Arc<Vec<Value>>),
    Resource(ResourceView),
    Neighbor(NeighborView),
    /// The host entity handle bound to the execute parameter.
    Entity,
}

impl Value {
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Num(_) => "number",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Resource(_) => "resource",
            Self::Neighbor(_) => "neighbor",
            Self::Entity => "entity",
        }
    }

    pub fn as_num(&self) -> Result<f64, ExecError> {
        match self {
            Self::Num(n) => Ok(*n),
            other => Err(ExecError::Type { expected: "number", found: other.type_name() }),
        }
    }

    fn truthy(&self) -> Result<bool, ExecError> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Num(n) => Ok(*n != 0.0),
            other => Err(ExecError::Type { expected: "bool", found: other.type_name() }),
        }
    }

    fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Unit, Self::Unit) => true,
            (Self::Resource(a), Self::Resource(b)) => a.slot == b.slot,
            _ => false,
        }
    }
}

/// Per-trait-instance state: the `self.<field>` storage.
pub type ScriptState = HashMap<String, Value>;

/// The capability surface trait code sees as `entity`.
///
/// The static validator guarantees only whitelisted names reach these
/// methods; implementations must still reject unknown names.
pub trait TraitHost {
    fn get_attr(&self, name: &str) -> Result<Value, ExecError>;
    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), ExecError>;
    fn call_method(&mut self, name: &str, args: &[Value]) -> Result<Value, ExecError>;
}

/// Host used while running `init()`: there is no entity yet.
pub struct NoEntity;

impl TraitHost for NoEntity {
    fn get_attr(&self, name: &str) -> Result<Value, ExecError> {
        Err(ExecError::UnknownAttr(format!("{name} (no entity in init)")))
    }

    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), ExecError> {
        Err(ExecError::UnknownAttr(format!("{name} (no entity in init)")))
    }

    fn call_method(&mut self, name: &str, _args: &[Value]) -> Result<Value, ExecError> {
        Err(ExecError::UnknownFunction(format!("{name} (no entity in init)")))
    }
}

/// Combined op + wall-clock budget for one invocation.
#[derive(Debug)]
pub struct ExecBudget {
    ops_remaining: u64,
    deadline: Option<Instant>,
    since_deadline_check: u32,
}

impl ExecBudget {
    /// Budget with both an op ceiling and a wall-clock deadline.
    #[must_use]
    pub fn new(wall: Duration, max_ops: u64) -> Self {
        Self {
            ops_remaining: max_ops,
            deadline: Some(Instant::now() + wall),
            since_deadline_check: 0,
        }
    }

    /// Op-limited budget without a deadline. Used by tests and `init()`.
    #[must_use]
    pub fn ops_only(max_ops: u64) -> Self {
        Self {
            ops_remaining: max_ops,
            deadline: None,
            since_deadline_check: 0,
        }
    }

    fn charge(&mut self) -> Result<(), ExecError> {
        if self.ops_remaining == 0 {
            return Err(ExecError::BudgetExhausted);
        }
        self.ops_remaining -= 1;
        self.since_deadline_check += 1;
        if self.since_deadline_check >= DEADLINE_CHECK_INTERVAL {
            self.since_deadline_check = 0;
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(ExecError::BudgetExhausted);
                }
            }
        }
        Ok(())
    }
}

/// Signature lookup for built-in module functions, used by the compiler's
/// resolution pass. Returns (min_args, max_args).
#[must_use]
pub fn module_signature(module: &str, function: &str) -> Option<(usize, usize)> {
    match (module, function) {
        ("math", "sqrt" | "abs" | "sin" | "cos" | "tan" | "floor" | "ceil" | "round" | "exp"
            | "ln" | "sign") => Some((1, 1)),
        ("math", "min" | "max" | "pow" | "atan2" | "hypot") => Some((2, 2)),
        ("math", "clamp") => Some((3, 3)),
        ("random", "range") => Some((2, 2)),
        ("random", "chance") => Some((1, 1)),
        ("random", "pick") => Some((1, 1)),
        _ => None,
    }
}

fn uniform01(rng: &mut dyn RngCore) -> f64 {
    // 53 high bits give a uniform double in [0, 1).
    (rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

fn call_module(
    module: &str,
    function: &str,
    args: &[Value],
    rng: &mut dyn RngCore,
) -> Result<Value, ExecError> {
    let num = |i: usize| args[i].as_num();
    let out = match (module, function) {
        ("math", "sqrt") => Value::Num(num(0)?.sqrt()),
        ("math", "abs") => Value::Num(num(0)?.abs()),
        ("math", "sin") => Value::Num(num(0)?.sin()),
        ("math", "cos") => Value::Num(num(0)?.cos()),
        ("math", "tan") => Value::Num(num(0)?.tan()),
        ("math", "floor") => Value::Num(num(0)?.floor()),
        ("math", "ceil") => Value::Num(num(0)?.ceil()),
        ("math", "round") => Value::Num(num(0)?.round()),
        ("math", "exp") => Value::Num(num(0)?.exp()),
        ("math", "ln") => Value::Num(num(0)?.ln()),
        ("math", "sign") => Value::Num(num(0)?.signum()),
        ("math", "min") => Value::Num(num(0)?.min(num(1)?)),
        ("math", "max") => Value::Num(num(0)?.max(num(1)?)),
        ("math", "pow") => Value::Num(num(0)?.powf(num(1)?)),
        ("math", "atan2") => Value::Num(num(0)?.atan2(num(1)?)),
        ("math", "hypot") => Value::Num(num(0)?.hypot(num(1)?)),
        ("math", "clamp") => Value::Num(num(0)?.clamp(num(1)?, num(2)?)),
        ("random", "range") => {
            let (lo, hi) = (num(0)?, num(1)?);
            Value::Num(lo + (hi - lo) * uniform01(rng))
        }
        ("random", "chance") => Value::Bool(uniform01(rng) < num(0)?),
        ("random", "pick") => match &args[0] {
            Value::List(items) if !items.is_empty() => {
                let idx = (uniform01(rng) * items.len() as f64) as usize;
                items[idx.min(items.len() - 1)].clone()
            }
            Value::List(_) => Value::Unit,
            other => {
                return Err(ExecError::Type { expected: "list", found: other.type_name() });
            }
        },
        _ => return Err(ExecError::UnknownFunction(format!("{module}::{function}"))),
    };
    Ok(out)
}

fn view_field(value: &Value, field: &str) -> Result<Value, ExecError> {
    let out = match (value, field) {
        (Value::Resource(r), "x") => Value::Num(f64::from(r.x)),
        (Value::Resource(r), "y") => Value::Num(f64::from(r.y)),
        (Value::Resource(r), "amount") => Value::Num(f64::from(r.amount)),
        (Value::Neighbor(n), "x") => Value::Num(f64::from(n.x)),
        (Value::Neighbor(n), "y") => Value::Num(f64::from(n.y)),
        (Value::Neighbor(n), "energy") => Value::Num(f64::from(n.energy)),
        (Value::Neighbor(n), "radius") => Value::Num(f64::from(n.radius)),
        (Value::Neighbor(n), "predator") => Value::Bool(n.predator),
        (Value::Neighbor(n), "infected") => Value::Bool(n.infected),
        (Value::List(items), "len") => Value::Num(items.len() as f64),
        _ => return Err(ExecError::UnknownAttr(field.to_string())),
    };
    Ok(out)
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// One interpreter activation over a single member function.
pub struct Interp<'a> {
    pub host: &'a mut dyn TraitHost,
    pub state: &'a mut ScriptState,
    pub rng: &'a mut dyn RngCore,
    pub budget: &'a mut ExecBudget,
    pub consts: &'a HashMap<String, Value>,
    pub members: &'a [FnDef],
    depth: u32,
}

impl<'a> Interp<'a> {
    pub fn new(
        host: &'a mut dyn TraitHost,
        state: &'a mut ScriptState,
        rng: &'a mut dyn RngCore,
        budget: &'a mut ExecBudget,
        consts: &'a HashMap<String, Value>,
        members: &'a [FnDef],
    ) -> Self {
        Self { host, state, rng, budget, consts, members, depth: 0 }
    }

    /// Run a member function with the given arguments already evaluated.
    pub fn run_fn(&mut self, def: &FnDef, args: Vec<Value>) -> Result<Value, ExecError> {
        if args.len() != def.params.len() {
            return Err(ExecError::Arity {
                function: def.name.clone(),
                expected: def.params.len(),
                got: args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ExecError::CallDepth);
        }
        self.depth += 1;
        let mut env: Vec<HashMap<String, Value>> = vec![def
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect()];
        let result = self.exec_block(&def.body, &mut env);
        self.depth -= 1;
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Unit),
        }
    }

    fn exec_block(
        &mut self,
        stmts: &[Stmt],
        env: &mut Vec<HashMap<String, Value>>,
    ) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        env: &mut Vec<HashMap<String, Value>>,
    ) -> Result<Flow, ExecError> {
        self.budget.charge()?;
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.eval(value, env)?;
                env.last_mut()
                    .expect("env always has a scope")
                    .insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, op, value } => {
                let rhs = self.eval(value, env)?;
                self.assign(target, *op, rhs, env)?;
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            Stmt::If { condition, then_body, else_body } => {
                let branch = if self.eval(condition, env)?.truthy()? {
                    then_body
                } else {
                    else_body
                };
                env.push(HashMap::new());
                let flow = self.exec_block(branch, env);
                env.pop();
                flow
            }
            Stmt::ForRange { var, start, end, body } => {
                let start = self.eval(start, env)?.as_num()?.floor() as i64;
                let end = self.eval(end, env)?.as_num()?.floor() as i64;
                let mut iterations: u64 = 0;
                for i in start..end {
                    iterations += 1;
                    if iterations > LOOP_ITERATION_LIMIT {
                        return Err(ExecError::LoopLimit);
                    }
                    env.push(HashMap::from([(var.clone(), Value::Num(i as f64))]));
                    let flow = self.exec_block(body, env);
                    env.pop();
                    match flow? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForEach { var, iterable, body } => {
                let iterable = self.eval(iterable, env)?;
                let Value::List(items) = iterable else {
                    return Err(ExecError::Type {
                        expected: "list",
                        found: iterable.type_name(),
                    });
                };
                let mut iterations: u64 = 0;
                for item in items.iter() {
                    iterations += 1;
                    if iterations > LOOP_ITERATION_LIMIT {
                        return Err(ExecError::LoopLimit);
                    }
                    env.push(HashMap::from([(var.clone(), item.clone())]));
                    let flow = self.exec_block(body, env);
                    env.pop();
                    match flow? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::Unit,
                };
                Ok(Flow::Return(value))
            }
        }
    }

    fn assign(
        &mut self,
        target: &AssignTarget,
        op: AssignOp,
        rhs: Value,
        env: &mut Vec<HashMap<String, Value>>,
    ) -> Result<(), ExecError> {
        let combine = |current: Value, rhs: Value| -> Result<Value, ExecError> {
            if op == AssignOp::Set {
                return Ok(rhs);
            }
            let (a, b) = (current.as_num()?, rhs.as_num()?);
            Ok(Value::Num(match op {
                AssignOp::Add => a + b,
                AssignOp::Sub => a - b,
                AssignOp::Mul => a * b,
                AssignOp::Div => a / b,
                AssignOp::Set => unreachable!(),
            }))
        };

        match target {
            AssignTarget::Local(name) => {
                for scope in env.iter_mut().rev() {
                    if let Some(slot) = scope.get_mut(name) {
                        let current = slot.clone();
                        *slot = combine(current, rhs)?;
                        return Ok(());
                    }
                }
                // Implicit declaration in the current scope on plain `=`.
                if op == AssignOp::Set {
                    env.last_mut()
                        .expect("env always has a scope")
                        .insert(name.clone(), rhs);
                    return Ok(());
                }
                Err(ExecError::UnknownName(name.clone()))
            }
            AssignTarget::SelfField(field) => {
                let current = self.state.get(field).cloned().unwrap_or(Value::Num(0.0));
                let next = combine(current, rhs)?;
                self.state.insert(field.clone(), next);
                Ok(())
            }
            AssignTarget::Field { object, field } => {
                let is_entity = env
                    .iter()
                    .rev()
                    .find_map(|scope| scope.get(object))
                    .is_some_and(|v| matches!(v, Value::Entity));
                if !is_entity {
                    return Err(ExecError::UnknownAttr(format!("{object}.{field}")));
                }
                let next = if op == AssignOp::Set {
                    rhs
                } else {
                    combine(self.host.get_attr(field)?, rhs)?
                };
                self.host.set_attr(field, next)
            }
        }
    }

    fn eval(
        &mut self,
        expr: &Expr,
        env: &mut Vec<HashMap<String, Value>>,
    ) -> Result<Value, ExecError> {
        self.budget.charge()?;
        match expr {
            Expr::Number(n) => Ok(Value::Num(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Ident(name) => {
                for scope in env.iter().rev() {
                    if let Some(value) = scope.get(name) {
                        return Ok(value.clone());
                    }
                }
                self.consts
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExecError::UnknownName(name.clone()))
            }
            Expr::SelfField(field) => Ok(self
                .state
                .get(field)
                .cloned()
                .unwrap_or(Value::Num(0.0))),
            Expr::Field { object, field } => {
                let object = self.eval(object, env)?;
                match object {
                    Value::Entity => self.host.get_attr(field),
                    other => view_field(&other, field),
                }
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, env)?;
                match op {
                    UnaryOp::Neg => Ok(Value::Num(-value.as_num()?)),
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy()?)),
                    // The validator rejects await before execution.
                    UnaryOp::Await => Err(ExecError::Host("await is not supported".into())),
                }
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, env),
            Expr::ModuleCall { module, function, args, .. } => {
                let sig = module_signature(module, function).ok_or_else(|| {
                    ExecError::UnknownFunction(format!("{module}::{function}"))
                })?;
                let args = self.eval_args(args, env)?;
                if args.len() < sig.0 || args.len() > sig.1 {
                    return Err(ExecError::Arity {
                        function: format!("{module}::{function}"),
                        expected: sig.0,
                        got: args.len(),
                    });
                }
                call_module(module, function, &args, self.rng)
            }
            Expr::MethodCall { object, method, args, .. } => {
                let object = self.eval(object, env)?;
                let args = self.eval_args(args, env)?;
                match object {
                    Value::Entity => self.host.call_method(method, &args),
                    other => {
                        // Field-style accessors callable on views, e.g. list.len().
                        if args.is_empty() {
                            view_field(&other, method)
                        } else {
                            Err(ExecError::UnknownFunction(method.clone()))
                        }
                    }
                }
            }
            Expr::SelfCall { method, args, .. } => {
                let args = self.eval_args(args, env)?;
                let def = self
                    .members
                    .iter()
                    .find(|f| &f.name == method)
                    .ok_or_else(|| ExecError::UnknownFunction(format!("self.{method}")))?;
                // Member lookup is by value because the interpreter borrows
                // members immutably for its whole lifetime.
                let def = def.clone();
                self.run_fn(&def, args)
            }
            Expr::BareCall { function, .. } => {
                Err(ExecError::UnknownFunction(function.clone()))
            }
        }
    }

    fn eval_args(
        &mut self,
        args: &[Expr],
        env: &mut Vec<HashMap<String, Value>>,
    ) -> Result<Vec<Value>, ExecError> {
        args.iter().map(|arg| self.eval(arg, env)).collect()
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        env: &mut Vec<HashMap<String, Value>>,
    ) -> Result<Value, ExecError> {
        // Short-circuiting logical operators.
        match op {
            BinaryOp::And => {
                if !self.eval(left, env)?.truthy()? {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(right, env)?.truthy()?));
            }
            BinaryOp::Or => {
                if self.eval(left, env)?.truthy()? {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(right, env)?.truthy()?));
            }
            _ => {}
        }

        let lhs = self.eval(left, env)?;
        let rhs = self.eval(right, env)?;
        match op {
            BinaryOp::Eq => return Ok(Value::Bool(lhs.loose_eq(&rhs))),
            BinaryOp::Ne => return Ok(Value::Bool(!lhs.loose_eq(&rhs))),
            _ => {}
        }

        let (a, b) = (lhs.as_num()?, rhs.as_num()?);
        let out = match op {
            BinaryOp::Add => Value::Num(a + b),
            BinaryOp::Sub => Value::Num(a - b),
            BinaryOp::Mul => Value::Num(a * b),
            BinaryOp::Div => Value::Num(a / b),
            BinaryOp::Rem => Value::Num(a % b),
            BinaryOp::Lt => Value::Bool(a < b),
            BinaryOp::Le => Value::Bool(a <= b),
            BinaryOp::Gt => Value::Bool(a > b),
            BinaryOp::Ge => Value::Bool(a >= b),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::Ne => unreachable!(),
        };
        Ok(out)
    }
}
