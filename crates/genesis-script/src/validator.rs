//! Static validation of GeneScript sources.
//!
//! Validation is a pure function over source text. Checks run in a fixed
//! order and the first failure short-circuits, so a rejected source reports
//! the earliest broken rule. Duplicate detection is the caller's job: the
//! mutation store owns the hash index, this module only computes the hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::ast::{AssignTarget, Expr, FnDef, Item, Module, Stmt, TraitDef, UnaryOp};
use crate::parser;

/// Closed set of validator and loader failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    SyntaxError,
    ImportForbidden,
    BannedCall,
    BannedAttr,
    ModuleLevelCode,
    NoTraitClass,
    EntityAttrForbidden,
    InitRequiredArgs,
    AwaitOnSync,
    DuplicateCode,
    LoadFailed,
    ClassNotFound,
    ImportTimeout,
}

impl FailureCode {
    /// Wire spelling used in events and operator error envelopes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::ImportForbidden => "IMPORT_FORBIDDEN",
            Self::BannedCall => "BANNED_CALL",
            Self::BannedAttr => "BANNED_ATTR",
            Self::ModuleLevelCode => "MODULE_LEVEL_CODE",
            Self::NoTraitClass => "NO_TRAIT_CLASS",
            Self::EntityAttrForbidden => "ENTITY_ATTR_FORBIDDEN",
            Self::InitRequiredArgs => "INIT_REQUIRED_ARGS",
            Self::AwaitOnSync => "AWAIT_ON_SYNC",
            Self::DuplicateCode => "DUPLICATE_CODE",
            Self::LoadFailed => "LOAD_FAILED",
            Self::ClassNotFound => "CLASS_NOT_FOUND",
            Self::ImportTimeout => "IMPORT_TIMEOUT",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modules a mutation may `use`.
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &["math", "random"];

/// Callable names that are never allowed, whatever their position.
const BANNED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "import",
    "__import__",
    "getattr",
    "setattr",
    "delattr",
    "exit",
    "quit",
    "print",
    "println",
    "spawn",
];

/// Identifier and field names that expose internals.
const BANNED_ATTRS: &[&str] = &[
    "__subclasses__",
    "__bases__",
    "__globals__",
    "__code__",
    "__builtins__",
    "__dict__",
];

/// Everything trait code may touch on an entity: attributes and methods.
pub const ALLOWED_ENTITY_ATTRS: &[&str] = &[
    "x",
    "y",
    "energy",
    "max_energy",
    "age",
    "generation",
    "state",
    "traits",
    "metabolism_rate",
    "energy_consumption_rate",
    "nearby_entities",
    "nearby_resources",
    "move",
    "consume_resource",
];

/// Outcome of validating one source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub accepted: bool,
    /// Name of the trait block when the contract check passed.
    pub trait_name: Option<String>,
    pub failure: Option<FailureCode>,
    /// Human-readable detail for the failure, if any.
    pub error: Option<String>,
    /// One line per check level, for narration and debugging.
    pub log: Vec<String>,
    /// SHA-256 of the normalized source, hex encoded.
    pub code_hash: String,
}

impl ValidationReport {
    fn rejected(code: FailureCode, error: String, log: Vec<String>, hash: String) -> Self {
        warn!(code = code.as_str(), error = %error, "validation rejected source");
        Self {
            accepted: false,
            trait_name: None,
            failure: Some(code),
            error: Some(error),
            log,
            code_hash: hash,
        }
    }
}

/// SHA-256 over the normalized source: CR stripped, trailing whitespace
/// trimmed per line, outer blank lines removed. Formatting-only resubmits
/// therefore hash identically.
#[must_use]
pub fn content_hash(source: &str) -> String {
    let normalized: String = source
        .replace('\r', "")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Validate a source text against the default import allow-list.
#[must_use]
pub fn validate_source(source: &str) -> ValidationReport {
    validate_source_with(source, DEFAULT_ALLOWED_IMPORTS)
}

/// Validate a source text with an explicit import allow-list.
#[must_use]
pub fn validate_source_with(source: &str, allowed_imports: &[&str]) -> ValidationReport {
    let hash = content_hash(source);
    let mut log = Vec::new();

    // Level 1: syntax.
    let module = match parser::parse(source) {
        Ok(module) => module,
        Err(err) => {
            return ValidationReport::rejected(
                FailureCode::SyntaxError,
                format!("syntax error: {err}"),
                log,
                hash,
            );
        }
    };
    log.push("syntax ok".to_string());

    // Level 2: import allow-list.
    for item in &module.items {
        if let Item::Use { module: name, line } = item {
            if !allowed_imports.contains(&name.as_str()) {
                return ValidationReport::rejected(
                    FailureCode::ImportForbidden,
                    format!(
                        "line {line}: forbidden import '{name}' (allowed: {})",
                        allowed_imports.join(", ")
                    ),
                    log,
                    hash,
                );
            }
        }
    }
    log.push("imports ok".to_string());

    // Level 3: banned calls.
    if let Some(detail) = find_banned_call(&module) {
        return ValidationReport::rejected(FailureCode::BannedCall, detail, log, hash);
    }
    log.push("calls ok".to_string());

    // Level 4: banned attributes and identifiers.
    if let Some(detail) = find_banned_attr(&module) {
        return ValidationReport::rejected(FailureCode::BannedAttr, detail, log, hash);
    }
    log.push("attributes ok".to_string());

    // Level 5: nothing but imports, constants and the trait block at top level.
    if let Some(detail) = find_module_level_code(&module) {
        return ValidationReport::rejected(FailureCode::ModuleLevelCode, detail, log, hash);
    }
    log.push("top level ok".to_string());

    // Level 6: trait contract.
    let def = match trait_contract(&module) {
        Ok(def) => def,
        Err(detail) => {
            return ValidationReport::rejected(FailureCode::NoTraitClass, detail, log, hash);
        }
    };
    log.push(format!("contract ok: {}", def.name));

    // Level 7: entity attribute whitelist.
    if let Some(detail) = find_forbidden_entity_attr(def) {
        return ValidationReport::rejected(FailureCode::EntityAttrForbidden, detail, log, hash);
    }
    log.push("entity attributes ok".to_string());

    // Level 8: init signature.
    if let Some(init) = &def.init {
        if !init.params.is_empty() {
            return ValidationReport::rejected(
                FailureCode::InitRequiredArgs,
                format!(
                    "line {}: traits are instantiated without arguments, init requires: {}",
                    init.line,
                    init.params.join(", ")
                ),
                log,
                hash,
            );
        }
    }
    log.push("init signature ok".to_string());

    // Level 9: await misuse.
    if let Some(detail) = find_await(def) {
        return ValidationReport::rejected(FailureCode::AwaitOnSync, detail, log, hash);
    }
    log.push("no await misuse".to_string());

    ValidationReport {
        accepted: true,
        trait_name: Some(def.name.clone()),
        failure: None,
        error: None,
        log,
        code_hash: hash,
    }
}

fn trait_contract(module: &Module) -> Result<&TraitDef, String> {
    let mut traits = module.items.iter().filter_map(|item| match item {
        Item::Trait(def) => Some(def),
        _ => None,
    });
    let Some(def) = traits.next() else {
        return Err("no trait block found (expected exactly one `trait Name { ... }`)".into());
    };
    if let Some(extra) = traits.next() {
        return Err(format!(
            "multiple trait blocks found ('{}' and '{}'); exactly one is allowed",
            def.name, extra.name
        ));
    }
    let Some(execute) = def.member("execute") else {
        return Err(format!(
            "trait '{}' has no `fn execute(entity)` member",
            def.name
        ));
    };
    if execute.params.is_empty() {
        return Err(format!(
            "line {}: execute must take the entity as its first parameter",
            execute.line
        ));
    }
    Ok(def)
}

fn find_module_level_code(module: &Module) -> Option<String> {
    for item in &module.items {
        match item {
            Item::Stray { line } => {
                return Some(format!(
                    "line {line}: only imports, constants and one trait block may appear at module level"
                ));
            }
            Item::Const { name, value, line } => {
                if !is_literal(value) {
                    return Some(format!(
                        "line {line}: const {name} must be a literal value"
                    ));
                }
            }
            _ => {}
        }
    }
    None
}

fn is_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Number(_) | Expr::Bool(_) | Expr::Str(_) => true,
        Expr::Unary { op: UnaryOp::Neg, operand } => is_literal(operand),
        _ => false,
    }
}

/// Names that refer to the host entity inside a function body.
fn entity_names(def: &TraitDef) -> Vec<&str> {
    let mut names = vec!["entity"];
    if let Some(execute) = def.member("execute") {
        if let Some(first) = execute.params.first() {
            if !names.contains(&first.as_str()) {
                names.push(first);
            }
        }
    }
    names
}

fn find_forbidden_entity_attr(def: &TraitDef) -> Option<String> {
    let names = entity_names(def);
    let is_entity = |expr: &Expr| matches!(expr, Expr::Ident(id) if names.contains(&id.as_str()));
    let mut found = None;

    visit_trait(def, &mut |expr| {
        if found.is_some() {
            return;
        }
        match expr {
            Expr::Field { object, field } if is_entity(object) => {
                if !ALLOWED_ENTITY_ATTRS.contains(&field.as_str()) {
                    found = Some(format!(
                        "forbidden entity attribute 'entity.{field}' (allowed: {})",
                        ALLOWED_ENTITY_ATTRS.join(", ")
                    ));
                }
            }
            Expr::MethodCall { object, method, line, .. } if is_entity(object) => {
                if !ALLOWED_ENTITY_ATTRS.contains(&method.as_str()) {
                    found = Some(format!(
                        "line {line}: forbidden entity method 'entity.{method}()'"
                    ));
                }
            }
            _ => {}
        }
    });
    if found.is_some() {
        return found;
    }

    // Assignment targets bypass the expression walk.
    let mut target_found = None;
    visit_stmts_of(def, &mut |stmt| {
        if target_found.is_some() {
            return;
        }
        if let Stmt::Assign { target: AssignTarget::Field { object, field }, .. } = stmt {
            if names.contains(&object.as_str()) && !ALLOWED_ENTITY_ATTRS.contains(&field.as_str())
            {
                target_found = Some(format!(
                    "forbidden entity attribute assignment 'entity.{field} = ...'"
                ));
            }
        }
    });
    target_found
}

fn find_banned_call(module: &Module) -> Option<String> {
    let mut found = None;
    visit_module(module, &mut |expr| {
        if found.is_some() {
            return;
        }
        let name = match expr {
            Expr::BareCall { function, line, .. } => Some((function, *line)),
            Expr::ModuleCall { function, line, .. } => Some((function, *line)),
            Expr::MethodCall { method, line, .. } => Some((method, *line)),
            _ => None,
        };
        if let Some((name, line)) = name {
            if BANNED_CALLS.contains(&name.as_str()) {
                found = Some(format!("line {line}: forbidden call '{name}()'"));
            }
        }
    });
    found
}

fn find_banned_attr(module: &Module) -> Option<String> {
    let mut found = None;
    visit_module(module, &mut |expr| {
        if found.is_some() {
            return;
        }
        let name = match expr {
            Expr::Field { field, .. } => Some(field),
            Expr::SelfField(name) => Some(name),
            Expr::Ident(name) => Some(name),
            _ => None,
        };
        if let Some(name) = name {
            if BANNED_ATTRS.contains(&name.as_str()) {
                found = Some(format!("forbidden attribute or name '{name}'"));
            }
        }
    });
    found
}

fn find_await(def: &TraitDef) -> Option<String> {
    let names = entity_names(def);
    let mut found = None;
    visit_trait(def, &mut |expr| {
        if found.is_some() {
            return;
        }
        if let Expr::Unary { op: UnaryOp::Await, operand } = expr {
            let detail = match operand.as_ref() {
                Expr::MethodCall { object, method, .. }
                    if matches!(object.as_ref(), Expr::Ident(id) if names.contains(&id.as_str())) =>
                {
                    format!(
                        "'await entity.{method}()': entity methods are synchronous, call without await"
                    )
                }
                _ => "'await' has no meaning here: all trait code runs synchronously".to_string(),
            };
            found = Some(detail);
        }
    });
    found
}

// ---------------------------------------------------------------------------
// AST walkers

fn visit_module(module: &Module, visit: &mut dyn FnMut(&Expr)) {
    for item in &module.items {
        match item {
            Item::Const { value, .. } => visit_expr(value, visit),
            Item::Trait(def) => visit_trait(def, visit),
            _ => {}
        }
    }
}

fn visit_trait(def: &TraitDef, visit: &mut dyn FnMut(&Expr)) {
    if let Some(init) = &def.init {
        visit_fn(init, visit);
    }
    for member in &def.members {
        visit_fn(member, visit);
    }
}

fn visit_fn(def: &FnDef, visit: &mut dyn FnMut(&Expr)) {
    for stmt in &def.body {
        visit_stmt(stmt, visit);
    }
}

fn visit_stmt(stmt: &Stmt, visit: &mut dyn FnMut(&Expr)) {
    match stmt {
        Stmt::Let { value, .. } | Stmt::Assign { value, .. } => visit_expr(value, visit),
        Stmt::Expr(expr) => visit_expr(expr, visit),
        Stmt::If { condition, then_body, else_body } => {
            visit_expr(condition, visit);
            for s in then_body.iter().chain(else_body) {
                visit_stmt(s, visit);
            }
        }
        Stmt::ForRange { start, end, body, .. } => {
            visit_expr(start, visit);
            visit_expr(end, visit);
            for s in body {
                visit_stmt(s, visit);
            }
        }
        Stmt::ForEach { iterable, body, .. } => {
            visit_expr(iterable, visit);
            for s in body {
                visit_stmt(s, visit);
            }
        }
        Stmt::Return(Some(expr)) => visit_expr(expr, visit),
        Stmt::Return(None) | Stmt::Break | Stmt::Continue => {}
    }
}

fn visit_expr(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::Unary { operand, .. } => visit_expr(operand, visit),
        Expr::Binary { left, right, .. } => {
            visit_expr(left, visit);
            visit_expr(right, visit);
        }
        Expr::Field { object, .. } => visit_expr(object, visit),
        Expr::ModuleCall { args, .. } | Expr::SelfCall { args, .. } | Expr::BareCall { args, .. } => {
            for arg in args {
                visit_expr(arg, visit);
            }
        }
        Expr::MethodCall { object, args, .. } => {
            visit_expr(object, visit);
            for arg in args {
                visit_expr(arg, visit);
            }
        }
        _ => {}
    }
}

fn visit_stmts_of(def: &TraitDef, visit: &mut dyn FnMut(&Stmt)) {
    fn walk(stmts: &[Stmt], visit: &mut dyn FnMut(&Stmt)) {
        for stmt in stmts {
            visit(stmt);
            match stmt {
                Stmt::If { then_body, else_body, .. } => {
                    walk(then_body, visit);
                    walk(else_body, visit);
                }
                Stmt::ForRange { body, .. } | Stmt::ForEach { body, .. } => walk(body, visit),
                _ => {}
            }
        }
    }
    if let Some(init) = &def.init {
        walk(&init.body, visit);
    }
    for member in &def.members {
        walk(&member.body, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
use math;

trait EnergySaver {
    fn execute(entity) {
        if entity.energy < 20 {
            entity.metabolism_rate = 0.5;
        }
    }
}
"#;

    #[test]
    fn accepts_a_valid_trait() {
        let report = validate_source(VALID);
        assert!(report.accepted, "{:?}", report.error);
        assert_eq!(report.trait_name.as_deref(), Some("EnergySaver"));
        assert_eq!(report.code_hash.len(), 64);
    }

    #[test]
    fn rejects_syntax_errors() {
        let report = validate_source("trait { nope");
        assert_eq!(report.failure, Some(FailureCode::SyntaxError));
    }

    #[test]
    fn rejects_forbidden_imports() {
        let report =
            validate_source("use os;\ntrait T { fn execute(entity) { } }");
        assert_eq!(report.failure, Some(FailureCode::ImportForbidden));
        assert!(report.error.as_deref().unwrap_or_default().contains("os"));
    }

    #[test]
    fn rejects_banned_calls() {
        let report = validate_source(
            "trait T { fn execute(entity) { eval(\"x\"); } }",
        );
        assert_eq!(report.failure, Some(FailureCode::BannedCall));

        let report = validate_source(
            "use math;\ntrait T { fn execute(entity) { entity.open(1); } }",
        );
        assert_eq!(report.failure, Some(FailureCode::BannedCall));

        // Process spawning is banned in every call position.
        let report = validate_source(
            "trait T { fn execute(entity) { spawn(1); } }",
        );
        assert_eq!(report.failure, Some(FailureCode::BannedCall));

        let report = validate_source(
            "trait T { fn execute(entity) { entity.spawn(1); } }",
        );
        assert_eq!(report.failure, Some(FailureCode::BannedCall));
    }

    #[test]
    fn rejects_banned_attributes() {
        let report = validate_source(
            "trait T { fn execute(entity) { let g = entity.__globals__; } }",
        );
        assert_eq!(report.failure, Some(FailureCode::BannedAttr));
    }

    #[test]
    fn rejects_module_level_code() {
        let report = validate_source(
            "entity.energy = 5;\ntrait T { fn execute(entity) { } }",
        );
        assert_eq!(report.failure, Some(FailureCode::ModuleLevelCode));

        let report = validate_source(
            "const A = math::sqrt(4.0);\ntrait T { fn execute(entity) { } }",
        );
        assert_eq!(report.failure, Some(FailureCode::ModuleLevelCode));
    }

    #[test]
    fn requires_exactly_one_trait_with_execute() {
        let report = validate_source("use math;");
        assert_eq!(report.failure, Some(FailureCode::NoTraitClass));

        let report = validate_source(
            "trait A { fn execute(entity) { } }\ntrait B { fn execute(entity) { } }",
        );
        assert_eq!(report.failure, Some(FailureCode::NoTraitClass));

        let report = validate_source("trait T { fn act(entity) { } }");
        assert_eq!(report.failure, Some(FailureCode::NoTraitClass));

        let report = validate_source("trait T { fn execute() { } }");
        assert_eq!(report.failure, Some(FailureCode::NoTraitClass));
    }

    #[test]
    fn enforces_entity_attribute_whitelist() {
        let report = validate_source(
            "trait T { fn execute(entity) { let h = entity.hidden_field; } }",
        );
        assert_eq!(report.failure, Some(FailureCode::EntityAttrForbidden));

        let report = validate_source(
            "trait T { fn execute(entity) { entity.secret = 1; } }",
        );
        assert_eq!(report.failure, Some(FailureCode::EntityAttrForbidden));

        // The execute parameter may be named anything.
        let report = validate_source(
            "trait T { fn execute(host) { host.nonsense = 1; } }",
        );
        assert_eq!(report.failure, Some(FailureCode::EntityAttrForbidden));
    }

    #[test]
    fn rejects_init_with_required_args() {
        let report = validate_source(
            "trait T { init(speed) { self.speed = speed; } fn execute(entity) { } }",
        );
        assert_eq!(report.failure, Some(FailureCode::InitRequiredArgs));
    }

    #[test]
    fn rejects_await_on_entity_methods() {
        let report = validate_source(
            "trait T { fn execute(entity) { await entity.move(1, 2); } }",
        );
        assert_eq!(report.failure, Some(FailureCode::AwaitOnSync));
        assert!(report.error.as_deref().unwrap_or_default().contains("move"));
    }

    #[test]
    fn hash_is_stable_under_whitespace_noise() {
        let a = content_hash("trait T { }\n");
        let b = content_hash("trait T { }   \r\n\n");
        assert_eq!(a, b);
        let c = content_hash("trait U { }");
        assert_ne!(a, c);
    }

    #[test]
    fn reports_pass_through_the_check_log() {
        let report = validate_source(VALID);
        assert!(report.log.iter().any(|l| l.contains("contract ok")));
    }
}
