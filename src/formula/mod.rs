//! Formula language for manual-compute indicators
//!
//! ```text
//! script → lexer (per line) → parser (Program AST) → interpreter (f64)
//!                                                        ↓
//!                                     evaluator (CalculatedIndicatorValues)
//! ```
//!
//! Formulas see one binding per other indicator (`v1.c`, `v1.p`, `v1.r`,
//! `v1.s`), their own locals, an allow-list of numeric functions (also as
//! `Math.<name>`) and `interpolation`. Nothing else is reachable.

pub mod evaluator;
pub mod functions;
pub mod interpreter;
pub mod lexer;
pub mod parser;

pub use evaluator::{compile, evaluate, CompiledFormula};
pub use functions::interpolation;
pub use interpreter::Binding;
pub use lexer::referenced_variables;
