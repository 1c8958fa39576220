//! GeneScript: the constrained language for hot-loaded entity behaviours.
//!
//! Mutations arrive as source text from an LLM, pass a static validator, and
//! compile into [`TraitProgram`]s the engine interprets under strict CPU
//! budgets. A program touches the world only through the [`TraitHost`]
//! capability surface; there is no file, network, process or reflective
//! access to reach for.
//!
//! A minimal trait looks like:
//!
//! ```text
//! use math;
//!
//! trait EnergySaver {
//!     init() {
//!         self.threshold = 30.0;
//!     }
//!
//!     fn execute(entity) {
//!         if entity.energy < self.threshold {
//!             entity.metabolism_rate = 0.5;
//!         }
//!     }
//! }
//! ```

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod validator;

pub use interp::{
    ExecBudget, ExecError, NeighborView, ResourceView, ScriptState, TraitHost, Value,
    LOOP_ITERATION_LIMIT,
};
pub use program::{CompileError, TraitProgram, compile, compile_with, default_budget};
pub use validator::{
    ALLOWED_ENTITY_ATTRS, DEFAULT_ALLOWED_IMPORTS, FailureCode, ValidationReport, content_hash,
    validate_source, validate_source_with,
};
