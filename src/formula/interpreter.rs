//! Tree-walking interpreter over a compiled `Program`
//!
//! The only names a formula can reach are the bindings passed in, its own
//! locals, and the allow-list in `functions`.

use std::collections::HashMap;

use super::functions;
use super::parser::{BinaryOp, Expr, LogicalOp, Program, Statement, UnaryOp};
use crate::error::FormulaError;
use crate::model::{IndicatorValues, NodeValues};

/// Namespace qualifying the function allow-list (`Math.abs`)
const MATH_NAMESPACE: &str = "Math";

/// One indicator as seen from a formula: `c`, `p`, `r`, `s`
///
/// Missing values read as NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binding {
    pub c: f64,
    pub p: f64,
    pub r: f64,
    pub s: f64,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            c: f64::NAN,
            p: f64::NAN,
            r: f64::NAN,
            s: f64::NAN,
        }
    }
}

impl Binding {
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            "c" => Some(self.c),
            "p" => Some(self.p),
            "r" => Some(self.r),
            "s" => Some(self.s),
            _ => None,
        }
    }
}

impl From<&IndicatorValues> for Binding {
    fn from(values: &IndicatorValues) -> Self {
        Self {
            c: values.current.unwrap_or(f64::NAN),
            p: values.previous.unwrap_or(f64::NAN),
            r: values.ratio.map(|r| r / 100.0).unwrap_or(f64::NAN),
            s: values.score.as_ref().map(|s| s.value).unwrap_or(f64::NAN),
        }
    }
}

impl From<&NodeValues> for Binding {
    fn from(values: &NodeValues) -> Self {
        let raw = values.measured().map(Binding::from).unwrap_or_default();
        Self {
            s: values.score_value().unwrap_or(f64::NAN),
            ..raw
        }
    }
}

fn truthy(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

fn flag(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

struct Scope<'a> {
    bindings: &'a HashMap<String, Binding>,
    locals: HashMap<String, f64>,
}

impl<'a> Scope<'a> {
    fn is_reserved(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
            || name == MATH_NAMESPACE
            || functions::is_function(name)
            || functions::constant(name).is_some()
    }

    fn assign(&mut self, name: &str, value: f64) -> Result<(), FormulaError> {
        if self.is_reserved(name) {
            return Err(FormulaError::InvalidAssignment(name.to_string()));
        }
        self.locals.insert(name.to_string(), value);
        Ok(())
    }

    fn variable(&self, name: &str) -> Result<f64, FormulaError> {
        if let Some(value) = self.locals.get(name) {
            return Ok(*value);
        }
        if let Some(value) = functions::constant(name) {
            return Ok(value);
        }
        // A whole binding, a function or `Math` used as a number is NaN
        if self.bindings.contains_key(name) || functions::is_function(name) || name == MATH_NAMESPACE {
            return Ok(f64::NAN);
        }
        Err(FormulaError::UndefinedVariable(name.to_string()))
    }

    fn field(&self, binding: &str, field: &str) -> Result<f64, FormulaError> {
        if let Some(values) = self.bindings.get(binding) {
            return values.field(field).ok_or_else(|| FormulaError::UnknownField {
                binding: binding.to_string(),
                field: field.to_string(),
            });
        }
        if binding == MATH_NAMESPACE {
            if let Some(value) = functions::constant(field) {
                return Ok(value);
            }
            if functions::is_function(field) {
                return Ok(f64::NAN);
            }
            return Err(FormulaError::UndefinedVariable(format!("{}.{}", binding, field)));
        }
        if self.locals.contains_key(binding) {
            return Err(FormulaError::UnknownField {
                binding: binding.to_string(),
                field: field.to_string(),
            });
        }
        Err(FormulaError::UndefinedVariable(binding.to_string()))
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<f64, FormulaError> {
        let values = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;

        match functions::call(name, &values) {
            Some(result) => result,
            None if self.locals.contains_key(name) || self.bindings.contains_key(name) => {
                Err(FormulaError::NotAFunction(name.to_string()))
            }
            None => Err(FormulaError::UndefinedVariable(name.to_string())),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<f64, FormulaError> {
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::Variable(name) => self.variable(name),
            Expr::Field { binding, field } => self.field(binding, field),
            Expr::Call { name, args } => self.call(name, args),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Neg => -value,
                    UnaryOp::Plus => value,
                    UnaryOp::Not => flag(!truthy(value)),
                })
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                Ok(match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                    BinaryOp::Rem => l % r,
                    BinaryOp::Pow => l.powf(r),
                    BinaryOp::Eq => flag(l == r),
                    BinaryOp::Ne => flag(l != r),
                    BinaryOp::Lt => flag(l < r),
                    BinaryOp::Le => flag(l <= r),
                    BinaryOp::Gt => flag(l > r),
                    BinaryOp::Ge => flag(l >= r),
                })
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                match op {
                    LogicalOp::And if !truthy(l) => Ok(l),
                    LogicalOp::Or if truthy(l) => Ok(l),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                if truthy(self.eval(test)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }
}

/// Run `program` against `bindings`, returning the raw numeric result
pub fn execute(program: &Program, bindings: &HashMap<String, Binding>) -> Result<f64, FormulaError> {
    let mut scope = Scope {
        bindings,
        locals: HashMap::new(),
    };

    for statement in &program.statements {
        match statement {
            Statement::Assign {
                name,
                value,
                declare,
            } => {
                let value = scope.eval(value)?;
                if !declare && !scope.locals.contains_key(name) && !scope.is_reserved(name) {
                    log::debug!("Implicit local {} created by assignment", name);
                }
                scope.assign(name, value)?;
            }
            Statement::Expr(expr) => {
                scope.eval(expr)?;
            }
        }
    }

    scope.eval(&program.result)
}
