//! # rulekit: declarative ACTION / RULE interpreter
//!
//! rulekit executes business logic written as short declarative programs
//! against a mutable entity store.
//!
//! - **ACTION**: a guarded state transition over one entity type. Ordered
//!   preconditions must all hold before the optional effect block runs.
//! - **RULE**: a trigger-activated program. When a watched property changes,
//!   the rule scans entities matching a condition and updates them.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Source → Parser → AST → Registries → Executor → Store → EventEmitter → RuleEngine
//! ```
//!
//! ### Stage 1: Parsing
//! The [`parser`] module turns source text into [`ast`] definitions. It is
//! pure and deterministic; [`formatter`] prints an AST back to canonical text.
//!
//! ### Stage 2: Registration
//! [`registry::ActionRegistry`] and [`registry::RuleRegistry`] catalogue
//! definitions. Rules are indexed by trigger key.
//!
//! ### Stage 3: Execution
//! [`executor::ActionExecutor`] checks preconditions with the [`eval`]
//! module, applies effects, persists the diff through the [`store`] boundary,
//! emits [`event::UpdateEvent`]s and writes to the [`audit`] log.
//!
//! ### Stage 4: Reaction
//! [`rule_engine::RuleEngine`] listens on the emitter and runs matching rules,
//! cascading up to a configured depth.
//!
//! ### Batches
//! [`batch::BatchExecutor`] runs one action over many entities with bounded
//! concurrency, per-item timeout, retry and progress reporting.
//!
//! [`system::System`] wires all of the above together.

pub mod ast;
pub mod audit;
pub mod batch;
pub mod config;
pub mod error;
pub mod eval;
pub mod event;
pub mod executor;
pub mod formatter;
pub mod parser;
pub mod registry;
pub mod rule_engine;
pub mod service;
pub mod store;
pub mod system;
pub mod value;

// Re-exports
pub use ast::*;
pub use error::*;
pub use executor::{ExecutionRequest, ExecutionResult};
pub use parser::{parse, parse_expression, parse_file, ParseError, ParseResult};
pub use system::System;
pub use value::{Properties, Value};

pub use error::Error as RulekitError;
