//! Cell parsing shared by type inference and fact table loading.

use chrono::NaiveDate;

use crate::catalog::FieldType;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

pub fn parse_integer(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

pub fn parse_decimal(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" => Some(true),
        "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

/// Days since the Unix epoch, as stored in Arrow `Date32` columns.
pub fn date_to_days(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

/// True when `value` can be stored in a column of type `field_type`.
pub fn fits(field_type: FieldType, value: &str) -> bool {
    if is_blank(value) {
        return true;
    }
    match field_type {
        FieldType::String => true,
        FieldType::Integer => parse_integer(value).is_some(),
        FieldType::Decimal => parse_decimal(value).is_some(),
        FieldType::Boolean => parse_boolean(value).is_some(),
        FieldType::Date => parse_date(value).is_some(),
    }
}

/// Codes such as `05` lose meaning as numbers.
fn has_leading_zero(value: &str) -> bool {
    let digits = value.trim().trim_start_matches('-').as_bytes();
    digits.len() > 1 && digits[0] == b'0' && digits[1].is_ascii_digit()
}

/// Narrowest type that fits every sampled value. Inference is stricter than
/// loading: `1`/`0` columns stay integers and zero-padded codes stay strings.
pub fn infer_type<'a>(values: impl IntoIterator<Item = &'a str>) -> FieldType {
    let mut integer = true;
    let mut decimal = true;
    let mut boolean = true;
    let mut date = true;
    let mut seen = false;

    for value in values {
        if is_blank(value) {
            continue;
        }
        seen = true;
        let padded = has_leading_zero(value);
        integer = integer && !padded && parse_integer(value).is_some();
        decimal = decimal && !padded && parse_decimal(value).is_some();
        boolean = boolean
            && matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "false"
            );
        date = date && parse_date(value).is_some();
    }

    if !seen {
        FieldType::String
    } else if integer {
        FieldType::Integer
    } else if decimal {
        FieldType::Decimal
    } else if boolean {
        FieldType::Boolean
    } else if date {
        FieldType::Date
    } else {
        FieldType::String
    }
}
