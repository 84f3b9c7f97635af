//! Formula compilation and the failure-absorbing evaluation boundary
//!
//! A script is split into non-blank lines. Every line but the last runs as a
//! statement; the last line is the returned expression. Whatever goes wrong
//! in between comes back as a failed `CalculatedIndicatorValues`, never as an
//! error or a panic.

use std::collections::HashMap;

use super::interpreter::{execute, Binding};
use super::lexer::{strip_comment, tokenize};
use super::parser::{parse_result, parse_statement, split_statements, Expr, Program};
use crate::error::FormulaError;
use crate::model::CalculatedIndicatorValues;

/// Compile a script; `Ok(None)` for a blank script
///
/// Only whitespace is blank. A script holding nothing but comments returns
/// undefined, which is "no score".
pub fn compile(script: &str) -> Result<Option<Program>, FormulaError> {
    if script.trim().is_empty() {
        return Ok(None);
    }

    let lines: Vec<(usize, &str)> = script
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, strip_comment(line).trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect();

    let Some(((last_number, last_line), body)) = lines.split_last() else {
        return Ok(Some(Program {
            statements: Vec::new(),
            result: Expr::Number(f64::NAN),
        }));
    };

    let syntax = |line: usize| move |message: String| FormulaError::Syntax { line, message };

    let mut statements = Vec::new();
    for (number, line) in body {
        let tokens = tokenize(line).map_err(syntax(*number))?;
        for segment in split_statements(&tokens) {
            statements.push(parse_statement(segment).map_err(syntax(*number))?);
        }
    }

    let tokens = tokenize(last_line).map_err(syntax(*last_number))?;
    let segments = split_statements(&tokens);
    let result = match segments.as_slice() {
        [single] => parse_result(single).map_err(syntax(*last_number))?,
        [] => {
            return Err(FormulaError::Syntax {
                line: *last_number,
                message: "the last line must be an expression".to_string(),
            })
        }
        _ => {
            return Err(FormulaError::Syntax {
                line: *last_number,
                message: "the last line must hold a single expression".to_string(),
            })
        }
    };

    Ok(Some(Program { statements, result }))
}

/// Turn an execution result into published values
///
/// NaN and infinities mean "no score", which is not the same as zero.
pub fn outcome(result: Result<f64, FormulaError>) -> CalculatedIndicatorValues {
    match result {
        Ok(value) if value.is_finite() => CalculatedIndicatorValues::scored(Some(value)),
        Ok(_) => CalculatedIndicatorValues::scored(None),
        Err(err) => CalculatedIndicatorValues::failed(err.to_string()),
    }
}

/// A script compiled once and re-run as bindings change
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    source: String,
    program: Result<Option<Program>, FormulaError>,
}

impl CompiledFormula {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            program: compile(source),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_blank(&self) -> bool {
        matches!(self.program, Ok(None))
    }

    pub fn evaluate(&self, bindings: &HashMap<String, Binding>) -> CalculatedIndicatorValues {
        match &self.program {
            Ok(None) => CalculatedIndicatorValues::not_scored(),
            Ok(Some(program)) => outcome(execute(program, bindings)),
            Err(err) => CalculatedIndicatorValues::failed(err.to_string()),
        }
    }
}

/// Compile and run `script` in one go
pub fn evaluate(script: &str, bindings: &HashMap<String, Binding>) -> CalculatedIndicatorValues {
    CompiledFormula::new(script).evaluate(bindings)
}
