//! Heterogeneous comparison of job operands.
//!
//! Operands of the same kind compare natively. Operands of different kinds
//! are never equal; ordering them retries the same operator on their textual
//! forms instead of failing.

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDateTime, Timelike};

use crate::job::Operator;

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl Operand {
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Integral values keep a trailing `.0`, e.g. `5.0`.
            Operand::Number(n) if n.is_finite() && n.fract() == 0.0 => write!(f, "{n:.1}"),
            Operand::Number(n) if n.is_nan() => f.write_str("nan"),
            Operand::Number(n) => write!(f, "{n}"),
            Operand::Timestamp(ts) if ts.nanosecond() == 0 => {
                write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S"))
            }
            Operand::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.6f")),
            Operand::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Operand {
    fn from(n: f64) -> Self {
        Operand::Number(n)
    }
}

impl From<NaiveDateTime> for Operand {
    fn from(ts: NaiveDateTime) -> Self {
        Operand::Timestamp(ts)
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Operand::Text(s.to_string())
    }
}

impl From<String> for Operand {
    fn from(s: String) -> Self {
        Operand::Text(s)
    }
}

/// Operands of different kinds.
#[derive(Debug)]
struct Incompatible;

/// Native ordering; `Ok(None)` means unordered (a NaN was involved).
fn native_cmp(x: &Operand, y: &Operand) -> Result<Option<Ordering>, Incompatible> {
    match (x, y) {
        (Operand::Number(a), Operand::Number(b)) => Ok(a.partial_cmp(b)),
        (Operand::Timestamp(a), Operand::Timestamp(b)) => Ok(Some(a.cmp(b))),
        (Operand::Text(a), Operand::Text(b)) => Ok(Some(a.cmp(b))),
        _ => Err(Incompatible),
    }
}

/// Evaluates `x <operator> y`. Never fails: operands of different kinds are
/// unequal, and ordering them compares their textual representation.
pub fn compare(x: &Operand, y: &Operand, operator: Operator) -> bool {
    match native_cmp(x, y) {
        Ok(ordering) => match operator {
            Operator::Eq => ordering == Some(Ordering::Equal),
            Operator::Neq => ordering != Some(Ordering::Equal),
            Operator::Lgt => ordering == Some(Ordering::Greater),
            Operator::Lst => ordering == Some(Ordering::Less),
        },
        Err(Incompatible) => match operator {
            Operator::Eq => false,
            Operator::Neq => true,
            Operator::Lgt | Operator::Lst => compare(
                &Operand::Text(x.to_text()),
                &Operand::Text(y.to_text()),
                operator,
            ),
        },
    }
}

/// Like [`compare`], but takes the operator by name. Unknown operators are false.
pub fn compare_by_name(x: &Operand, y: &Operand, operator: &str) -> bool {
    operator
        .parse::<Operator>()
        .map(|op| compare(x, y, op))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> Operand {
        Operand::Timestamp(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn numbers_compare_natively() {
        let big = Operand::Number(1_100_000.0);
        let limit = Operand::Number(1_000_000.0);
        assert!(compare(&big, &limit, Operator::Lgt));
        assert!(!compare(&big, &limit, Operator::Lst));
        assert!(compare(&big, &limit, Operator::Neq));
        assert!(!compare(&big, &limit, Operator::Eq));
    }

    #[test]
    fn numbers_are_not_compared_lexically() {
        // "9" > "10" as text, but not as numbers.
        assert!(compare(&9.0.into(), &10.0.into(), Operator::Lst));
    }

    #[test]
    fn timestamps_compare_natively() {
        assert!(compare(&ts(2024, 5, 1), &ts(2020, 1, 1), Operator::Lgt));
        assert!(compare(&ts(2019, 12, 31), &ts(2020, 1, 1), Operator::Lst));
        assert!(compare(&ts(2020, 1, 1), &ts(2020, 1, 1), Operator::Eq));
    }

    #[test]
    fn equal_values_are_eq_in_every_kind() {
        let values = [
            Operand::Number(42.5),
            ts(2021, 6, 15),
            Operand::Text("wg0".into()),
        ];
        for v in &values {
            assert!(compare(v, v, Operator::Eq), "{v:?}");
            assert!(!compare(v, v, Operator::Neq), "{v:?}");
        }
    }

    #[test]
    fn mixed_kinds_are_never_equal() {
        assert!(!compare(&5.0.into(), &"5".into(), Operator::Eq));
        assert!(compare(&5.0.into(), &"5".into(), Operator::Neq));
        assert!(!compare(&ts(2020, 1, 1), &"2020-01-01 00:00:00".into(), Operator::Eq));
        assert!(compare(&ts(2020, 1, 1), &5.0.into(), Operator::Neq));
    }

    #[test]
    fn mixed_kinds_order_as_text() {
        // "100.0" < "9" lexically.
        assert!(compare(&100.0.into(), &"9".into(), Operator::Lst));
        // "5.0" > "5" lexically.
        assert!(compare(&5.0.into(), &"5".into(), Operator::Lgt));
        // "2020-01-01 00:00:00" < "abc" lexically.
        assert!(compare(&ts(2020, 1, 1), &"abc".into(), Operator::Lst));
    }

    #[test]
    fn textual_forms() {
        assert_eq!(Operand::Number(5.0).to_text(), "5.0");
        assert_eq!(Operand::Number(2.5).to_text(), "2.5");
        assert_eq!(Operand::Number(f64::NAN).to_text(), "nan");
        assert_eq!(ts(2020, 1, 1).to_text(), "2020-01-01 00:00:00");
    }

    #[test]
    fn nan_is_never_ordered() {
        let nan = Operand::Number(f64::NAN);
        let one = Operand::Number(1.0);
        assert!(!compare(&nan, &one, Operator::Eq));
        assert!(compare(&nan, &one, Operator::Neq));
        assert!(!compare(&nan, &one, Operator::Lgt));
        assert!(!compare(&nan, &one, Operator::Lst));
    }

    #[test]
    fn unknown_operator_is_false() {
        let a = Operand::Number(1.0);
        assert!(!compare_by_name(&a, &a, "gte"));
        assert!(!compare_by_name(&a, &a, ""));
        assert!(compare_by_name(&a, &a, "eq"));
    }
}
