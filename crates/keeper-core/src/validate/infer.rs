//! Column type inference.
//!
//! A sampled value is classified by pattern precedence (number, boolean,
//! date, email, url, then string), and a column's inferred type is the
//! majority classification among its non-empty sampled values, ties broken
//! by that same precedence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredType {
    Number,
    Boolean,
    Date,
    Email,
    Url,
    String,
}

impl InferredType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Email => "email",
            Self::Url => "url",
            Self::String => "string",
        }
    }
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-?\d+(\.\d+)?([eE][+-]?\d+)?$").expect("number pattern must compile")
    })
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // ISO dates with optional time portion, or US-style slashed dates.
        Regex::new(r"^(\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}(:\d{2})?(\.\d+)?Z?)?|\d{1,2}/\d{1,2}/\d{4})$")
            .expect("date pattern must compile")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w.+-]+@[\w-]+\.[\w.-]+$").expect("email pattern must compile"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://\S+$").expect("url pattern must compile"))
}

pub fn classify(value: &str) -> InferredType {
    let v = value.trim();
    if number_re().is_match(v) {
        return InferredType::Number;
    }
    if matches!(
        v.to_ascii_lowercase().as_str(),
        "true" | "false" | "yes" | "no"
    ) {
        return InferredType::Boolean;
    }
    if date_re().is_match(v) {
        return InferredType::Date;
    }
    if email_re().is_match(v) {
        return InferredType::Email;
    }
    if url_re().is_match(v) {
        return InferredType::Url;
    }
    InferredType::String
}

const PRECEDENCE: [InferredType; 6] = [
    InferredType::Number,
    InferredType::Boolean,
    InferredType::Date,
    InferredType::Email,
    InferredType::Url,
    InferredType::String,
];

/// Majority vote over non-empty sampled values. Empty samples infer to
/// string.
pub fn infer_column<'a, I>(values: I) -> InferredType
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts = [0usize; 6];
    let mut seen = false;
    for value in values {
        if value.trim().is_empty() {
            continue;
        }
        seen = true;
        let kind = classify(value);
        let slot = PRECEDENCE.iter().position(|p| *p == kind).unwrap_or(5);
        counts[slot] += 1;
    }
    if !seen {
        return InferredType::String;
    }
    // Earliest index with the highest count wins, which is precedence order.
    let mut best = 0;
    for (i, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = i;
        }
    }
    PRECEDENCE[best]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_precedence() {
        assert_eq!(classify("42"), InferredType::Number);
        assert_eq!(classify("-3.14"), InferredType::Number);
        assert_eq!(classify("1e6"), InferredType::Number);
        assert_eq!(classify("true"), InferredType::Boolean);
        assert_eq!(classify("No"), InferredType::Boolean);
        assert_eq!(classify("2024-01-31"), InferredType::Date);
        assert_eq!(classify("2024-01-31T09:30:00Z"), InferredType::Date);
        assert_eq!(classify("1/31/2024"), InferredType::Date);
        assert_eq!(classify("books@haven.example"), InferredType::Email);
        assert_eq!(classify("https://haven.example/hours"), InferredType::Url);
        assert_eq!(classify("Book Haven"), InferredType::String);
    }

    #[test]
    fn majority_vote_wins() {
        let values = ["1", "2", "3", "oops"];
        assert_eq!(infer_column(values), InferredType::Number);
    }

    #[test]
    fn tie_breaks_by_precedence() {
        let values = ["1", "hello"];
        assert_eq!(infer_column(values), InferredType::Number);
    }

    #[test]
    fn empty_samples_infer_string() {
        assert_eq!(infer_column(["", "  "]), InferredType::String);
        assert_eq!(infer_column(std::iter::empty::<&str>()), InferredType::String);
    }
}
