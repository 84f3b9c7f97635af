//! Allow-listed numeric functions and constants reachable from formulas

use crate::error::FormulaError;

/// Point on the line through `(x1, y1)` and `(x2, y2)` at `x`
///
/// Not clamped to `[x1, x2]`: thresholds are usually set beyond the expected
/// range, so values outside it extrapolate. A degenerate segment yields `y1`.
pub fn interpolation(x: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    if x1 == x2 {
        return y1;
    }
    y1 + (x - x1) * (y2 - y1) / (x2 - x1)
}

pub fn constant(name: &str) -> Option<f64> {
    let value = match name {
        "PI" => std::f64::consts::PI,
        "E" => std::f64::consts::E,
        "LN2" => std::f64::consts::LN_2,
        "LN10" => std::f64::consts::LN_10,
        "LOG2E" => std::f64::consts::LOG2_E,
        "LOG10E" => std::f64::consts::LOG10_E,
        "SQRT2" => std::f64::consts::SQRT_2,
        "SQRT1_2" => std::f64::consts::FRAC_1_SQRT_2,
        _ => return None,
    };
    Some(value)
}

enum Arity {
    Exact(usize),
    Any,
}

fn arity(name: &str) -> Option<Arity> {
    let arity = match name {
        "abs" | "acos" | "acosh" | "asin" | "asinh" | "atan" | "atanh" | "cbrt" | "ceil" | "cos"
        | "cosh" | "exp" | "expm1" | "floor" | "log" | "log10" | "log1p" | "log2" | "round"
        | "sign" | "sin" | "sinh" | "sqrt" | "tan" | "tanh" | "trunc" => Arity::Exact(1),
        "atan2" | "pow" => Arity::Exact(2),
        "interpolation" => Arity::Exact(5),
        "max" | "min" | "hypot" => Arity::Any,
        _ => return None,
    };
    Some(arity)
}

pub fn is_function(name: &str) -> bool {
    arity(name).is_some()
}

/// Half-up rounding toward positive infinity, so `round(-2.5) == -2`
fn round_half_up(x: f64) -> f64 {
    if x.is_finite() {
        (x + 0.5).floor()
    } else {
        x
    }
}

fn sign(x: f64) -> f64 {
    if x.is_nan() || x == 0.0 {
        x
    } else {
        x.signum()
    }
}

/// Call an allow-listed function; `None` when `name` is not one
pub fn call(name: &str, args: &[f64]) -> Option<Result<f64, FormulaError>> {
    let expected = arity(name)?;
    if let Arity::Exact(n) = expected {
        if args.len() != n {
            return Some(Err(FormulaError::Arity {
                name: name.to_string(),
                expected: n.to_string(),
                got: args.len(),
            }));
        }
    }

    let a = args.first().copied().unwrap_or(f64::NAN);
    let value = match name {
        "abs" => a.abs(),
        "acos" => a.acos(),
        "acosh" => a.acosh(),
        "asin" => a.asin(),
        "asinh" => a.asinh(),
        "atan" => a.atan(),
        "atanh" => a.atanh(),
        "cbrt" => a.cbrt(),
        "ceil" => a.ceil(),
        "cos" => a.cos(),
        "cosh" => a.cosh(),
        "exp" => a.exp(),
        "expm1" => a.exp_m1(),
        "floor" => a.floor(),
        "log" => a.ln(),
        "log10" => a.log10(),
        "log1p" => a.ln_1p(),
        "log2" => a.log2(),
        "round" => round_half_up(a),
        "sign" => sign(a),
        "sin" => a.sin(),
        "sinh" => a.sinh(),
        "sqrt" => a.sqrt(),
        "tan" => a.tan(),
        "tanh" => a.tanh(),
        "trunc" => a.trunc(),
        "atan2" => a.atan2(args[1]),
        "pow" => a.powf(args[1]),
        "interpolation" => interpolation(args[0], args[1], args[2], args[3], args[4]),
        "max" => fold_nan_aware(args, f64::NEG_INFINITY, f64::max),
        "min" => fold_nan_aware(args, f64::INFINITY, f64::min),
        "hypot" => args.iter().map(|x| x * x).sum::<f64>().sqrt(),
        _ => return None,
    };
    Some(Ok(value))
}

/// `max`/`min` where any NaN argument poisons the result
fn fold_nan_aware(args: &[f64], init: f64, pick: fn(f64, f64) -> f64) -> f64 {
    if args.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    args.iter().copied().fold(init, pick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_midpoint() {
        assert_eq!(interpolation(10.0, 0.0, 0.0, 20.0, 100.0), 50.0);
    }

    #[test]
    fn test_interpolation_extrapolates() {
        assert_eq!(interpolation(-5.0, 0.0, 0.0, 20.0, 100.0), -25.0);
        assert_eq!(interpolation(30.0, 0.0, 0.0, 20.0, 100.0), 150.0);
    }

    #[test]
    fn test_interpolation_degenerate_segment() {
        assert_eq!(interpolation(7.0, 3.0, 42.0, 3.0, 90.0), 42.0);
    }

    #[test]
    fn test_round_matches_half_up() {
        assert_eq!(call("round", &[2.5]).unwrap().unwrap(), 3.0);
        assert_eq!(call("round", &[-2.5]).unwrap().unwrap(), -2.0);
        assert_eq!(call("round", &[-2.6]).unwrap().unwrap(), -3.0);
    }

    #[test]
    fn test_max_min_and_nan() {
        assert_eq!(call("max", &[1.0, 7.0, 3.0]).unwrap().unwrap(), 7.0);
        assert_eq!(call("min", &[1.0, 7.0, 3.0]).unwrap().unwrap(), 1.0);
        assert!(call("max", &[1.0, f64::NAN]).unwrap().unwrap().is_nan());
        assert_eq!(call("max", &[]).unwrap().unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_sign_of_zero() {
        assert_eq!(call("sign", &[0.0]).unwrap().unwrap(), 0.0);
        assert_eq!(call("sign", &[-3.0]).unwrap().unwrap(), -1.0);
    }

    #[test]
    fn test_arity_is_checked() {
        let err = call("pow", &[2.0]).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "pow expects 2 argument(s), got 1");
    }

    #[test]
    fn test_unknown_function() {
        assert!(call("eval", &[1.0]).is_none());
        assert!(!is_function("random"));
        assert_eq!(constant("PI"), Some(std::f64::consts::PI));
    }
}
