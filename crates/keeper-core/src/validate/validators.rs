//! Built-in field validators.

use super::{FieldValidator, Severity, ValidationIssue};
use anyhow::Result;

/// Rejects latitude/longitude values outside the valid coordinate range.
/// Registered by default under the name `coordinate-range`.
pub struct CoordinateRangeValidator;

impl FieldValidator for CoordinateRangeValidator {
    fn validate(
        &self,
        value: &str,
        _row: &[String],
        _row_index: usize,
        column: &str,
    ) -> Result<Option<ValidationIssue>> {
        let limit = match column.to_ascii_lowercase().as_str() {
            "latitude" | "lat" => 90.0_f64,
            "longitude" | "lon" | "lng" => 180.0_f64,
            _ => return Ok(None),
        };
        let v = value.trim();
        if v.is_empty() {
            return Ok(None);
        }
        let parsed: f64 = match v.parse() {
            Ok(p) => p,
            Err(_) => {
                return Ok(Some(ValidationIssue::new(
                    Severity::Error,
                    "coordinate_not_numeric",
                    format!("{column} value '{v}' is not a number"),
                )))
            }
        };
        if !parsed.is_finite() || parsed.abs() > limit {
            return Ok(Some(ValidationIssue::new(
                Severity::Error,
                "coordinate_out_of_range",
                format!("{column} value '{v}' is outside the valid range of +/-{limit}"),
            )));
        }
        Ok(None)
    }
}

/// Flags values longer than a fixed limit, useful for catching cells that
/// swallowed an unquoted delimiter from a neighbouring column.
pub struct MaxLengthValidator {
    pub max_chars: usize,
}

impl FieldValidator for MaxLengthValidator {
    fn validate(
        &self,
        value: &str,
        _row: &[String],
        _row_index: usize,
        _column: &str,
    ) -> Result<Option<ValidationIssue>> {
        if value.chars().count() > self.max_chars {
            return Ok(Some(ValidationIssue::new(
                Severity::Warning,
                "value_too_long",
                format!(
                    "value exceeds {} characters ({} found)",
                    self.max_chars,
                    value.chars().count()
                ),
            )));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latitude_out_of_range_is_an_error() {
        let validator = CoordinateRangeValidator;
        let row = vec!["Book Haven".to_string(), "95.0".to_string()];
        let issue = validator
            .validate("95.0", &row, 0, "latitude")
            .unwrap()
            .expect("out-of-range latitude should be flagged");
        assert_eq!(issue.code, "coordinate_out_of_range");
        assert_eq!(issue.severity, Severity::Error);
    }

    #[test]
    fn valid_coordinates_pass() {
        let validator = CoordinateRangeValidator;
        assert!(validator
            .validate("-89.9", &[], 0, "latitude")
            .unwrap()
            .is_none());
        assert!(validator
            .validate("179.5", &[], 0, "longitude")
            .unwrap()
            .is_none());
    }

    #[test]
    fn non_coordinate_columns_are_ignored() {
        let validator = CoordinateRangeValidator;
        assert!(validator
            .validate("95.0", &[], 0, "price")
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_coordinate_cells_are_not_flagged() {
        let validator = CoordinateRangeValidator;
        assert!(validator.validate("", &[], 0, "latitude").unwrap().is_none());
    }

    #[test]
    fn overly_long_values_are_warned_about() {
        let validator = MaxLengthValidator { max_chars: 5 };
        let issue = validator
            .validate("much too long", &[], 0, "name")
            .unwrap()
            .expect("long value should be flagged");
        assert_eq!(issue.code, "value_too_long");
        assert_eq!(issue.severity, Severity::Warning);
        assert!(validator.validate("ok", &[], 0, "name").unwrap().is_none());
    }
}
