//! Conversion lattice and numeric helpers for `TemplateData`
//!
//! Conversions between stored types are characterized by a four-level
//! lattice: `identity > castable > coercible > ambiguous`. `cast` succeeds
//! at castable strength or better, `coerce` at coercible or better. The
//! table is total over `DataKind x DataKind`.

use super::{DataKind, TemplateData};

/// Strength of a conversion between two stored types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Conversion {
    Ambiguous,
    Coercible,
    Castable,
    Identity,
}

/// Rating of a conversion from `from` to `to`.
pub fn rating(from: DataKind, to: DataKind) -> Conversion {
    use Conversion::*;
    use DataKind::*;

    if from == to {
        return Identity;
    }

    match (from, to) {
        // Booleans interchange freely with the scalar types.
        (Bool, Int) | (Bool, Double) | (Bool, String) => Castable,
        (Int, Bool) | (Double, Bool) | (String, Bool) => Castable,

        // Widening int -> double is lossless; the reverse rounds.
        (Int, Double) => Castable,
        (Double, Int) => Coercible,

        // Scalars render to strings; strings parse back with less fidelity.
        (Int, String) | (Double, String) => Castable,
        (String, Int) | (String, Double) => Coercible,

        // Strings and raw byte buffers interchange.
        (String, Data) | (Data, String) => Castable,

        // A present collection answers for its own existence.
        (Array, Bool) | (Dictionary, Bool) => Coercible,

        // Collection-to-collection conversion carries no single meaning.
        (Array, Dictionary) | (Dictionary, Array) => Ambiguous,

        _ => Ambiguous,
    }
}

/// Apply the conversion `to`, assuming the lattice already permitted it.
/// Falls back to an errored value when the payload does not fit.
pub(super) fn perform(value: &TemplateData, to: DataKind) -> TemplateData {
    if value.kind() == to {
        return value.clone();
    }
    let failed = || {
        TemplateData::error(format!(
            "conversion of {} to {} failed",
            value.kind(),
            to
        ))
    };
    match to {
        DataKind::Bool => value.as_bool().map(TemplateData::from).unwrap_or_else(failed),
        DataKind::Int => value.as_int().map(TemplateData::from).unwrap_or_else(failed),
        DataKind::Double => value
            .as_double()
            .map(TemplateData::from)
            .unwrap_or_else(failed),
        DataKind::String => value
            .as_string()
            .map(TemplateData::from)
            .unwrap_or_else(failed),
        DataKind::Data => value.as_data().map(TemplateData::from).unwrap_or_else(failed),
        DataKind::Array => value
            .as_array()
            .map(TemplateData::array)
            .unwrap_or_else(failed),
        DataKind::Dictionary => value
            .as_dictionary()
            .map(TemplateData::dictionary)
            .unwrap_or_else(failed),
        DataKind::Void => TemplateData::true_nil(),
    }
}

/// String truthiness per the boolean keywords; any other non-empty string
/// has no canonical boolean reading here (callers decide).
pub(super) fn string_to_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// Round half away from zero, the lattice's `double -> int` coercion.
pub(super) fn double_to_int(d: f64) -> Option<i64> {
    if !d.is_finite() {
        return None;
    }
    let rounded = if d >= 0.0 { (d + 0.5).floor() } else { (d - 0.5).ceil() };
    if rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
        Some(rounded as i64)
    } else {
        None
    }
}

/// Render a double the way templates expect: integral values keep one
/// trailing `.0` so the type remains visible in output.
pub(super) fn format_double(d: f64) -> String {
    if d.fract() == 0.0 && d.is_finite() && d.abs() < 1e15 {
        format!("{:.1}", d)
    } else {
        format!("{}", d)
    }
}

/// Checked integer addition; overflow produces an errored value.
pub fn int_add(l: i64, r: i64) -> TemplateData {
    match l.checked_add(r) {
        Some(v) => v.into(),
        None => TemplateData::error(format!("integer overflow in {} + {}", l, r)),
    }
}

pub fn int_subtract(l: i64, r: i64) -> TemplateData {
    match l.checked_sub(r) {
        Some(v) => v.into(),
        None => TemplateData::error(format!("integer overflow in {} - {}", l, r)),
    }
}

pub fn int_multiply(l: i64, r: i64) -> TemplateData {
    match l.checked_mul(r) {
        Some(v) => v.into(),
        None => TemplateData::error(format!("integer overflow in {} * {}", l, r)),
    }
}

pub fn int_divide(l: i64, r: i64) -> TemplateData {
    if r == 0 {
        return TemplateData::error(format!("division by zero in {} / {}", l, r));
    }
    match l.checked_div(r) {
        Some(v) => v.into(),
        None => TemplateData::error(format!("integer overflow in {} / {}", l, r)),
    }
}

pub fn int_modulo(l: i64, r: i64) -> TemplateData {
    if r == 0 {
        return TemplateData::error(format!("division by zero in {} % {}", l, r));
    }
    match l.checked_rem(r) {
        Some(v) => v.into(),
        None => TemplateData::error(format!("integer overflow in {} % {}", l, r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice_required_entries() {
        use Conversion::*;
        use DataKind::*;
        assert_eq!(rating(Bool, Int), Castable);
        assert_eq!(rating(Bool, Double), Castable);
        assert_eq!(rating(Bool, String), Castable);
        assert_eq!(rating(String, Bool), Castable);
        assert_eq!(rating(Int, Double), Castable);
        assert_eq!(rating(Double, Int), Coercible);
        assert_eq!(rating(Array, Bool), Coercible);
        assert_eq!(rating(Dictionary, Bool), Coercible);
        assert_eq!(rating(Array, Dictionary), Ambiguous);
        assert_eq!(rating(Dictionary, Array), Ambiguous);
        assert_eq!(rating(Int, Int), Identity);
    }

    #[test]
    fn test_identity_outranks_everything() {
        for kind in [
            DataKind::Bool,
            DataKind::Int,
            DataKind::Double,
            DataKind::String,
            DataKind::Data,
            DataKind::Array,
            DataKind::Dictionary,
            DataKind::Void,
        ] {
            assert_eq!(rating(kind, kind), Conversion::Identity);
        }
    }

    #[test]
    fn test_double_to_int_rounds_away_from_zero() {
        assert_eq!(double_to_int(2.5), Some(3));
        assert_eq!(double_to_int(-2.5), Some(-3));
        assert_eq!(double_to_int(2.4), Some(2));
        assert_eq!(double_to_int(-2.4), Some(-2));
        assert_eq!(double_to_int(f64::NAN), None);
    }

    #[test]
    fn test_checked_arithmetic_errors() {
        assert!(int_add(i64::MAX, 1).errored());
        assert!(int_multiply(i64::MAX, 2).errored());
        assert!(int_divide(1, 0).errored());
        assert!(int_modulo(1, 0).errored());
        assert_eq!(int_add(2, 3).as_int(), Some(5));
    }

    #[test]
    fn test_cast_refused_below_castable() {
        let arr = TemplateData::array(vec![TemplateData::from(1i64)]);
        // array -> bool is only coercible
        assert!(arr.cast(DataKind::Bool).errored());
        assert_eq!(arr.coerce(DataKind::Bool).as_bool(), Some(true));
    }

    #[test]
    fn test_format_double_keeps_type_visible() {
        assert_eq!(format_double(3.0), "3.0");
        assert_eq!(format_double(1.5), "1.5");
    }
}
