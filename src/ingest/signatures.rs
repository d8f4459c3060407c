//! Known-defect signature matching for ingestion failures
//!
//! Upstream feeds occasionally ship records the store's decoder cannot
//! represent (a new enum value, a dangling cross-reference, a shape change).
//! Those failures surface as store errors whose messages follow recognizable
//! patterns. `classify` matches an error's full cause chain against an
//! explicit table and is a pure function, so the table is independently
//! testable and the single place to extend.
//!
//! TODO: replace message matching with a structured error code once the
//! upstream feed stabilizes its schema.

use regex::Regex;
use std::sync::OnceLock;

/// Defect category a failure message chain maps to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The payload used an enumerated value the decoder does not know
    UnknownEnumValue,
    /// A record referenced another record or vocabulary entry that is absent
    UnresolvedReference,
    /// The decoder could not build a record instance from the payload shape
    ConstructFailure,
    /// No known signature matched
    Unclassified,
}

impl ErrorCategory {
    /// True when the category represents a known upstream data defect
    pub fn is_known_defect(&self) -> bool {
        !matches!(self, ErrorCategory::Unclassified)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::UnknownEnumValue => "unknown-enum-value",
            ErrorCategory::UnresolvedReference => "unresolved-reference",
            ErrorCategory::ConstructFailure => "construct-failure",
            ErrorCategory::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

struct Signature {
    pattern: Regex,
    category: ErrorCategory,
}

fn signature_table() -> &'static [Signature] {
    static TABLE: OnceLock<Vec<Signature>> = OnceLock::new();
    TABLE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        let compile = |pattern: &str| Regex::new(pattern).expect("signature pattern is valid");
        vec![
            Signature {
                pattern: compile(
                    r"(?i)unrecognized enum(?:erated)? value|not one of the values accepted|unknown variant",
                ),
                category: ErrorCategory::UnknownEnumValue,
            },
            Signature {
                pattern: compile(
                    r"(?i)unresolved (?:reference|foreign key)|references? unknown|dangling reference",
                ),
                category: ErrorCategory::UnresolvedReference,
            },
            Signature {
                pattern: compile(
                    r"(?i)cannot construct instance|no suitable constructor|missing required field",
                ),
                category: ErrorCategory::ConstructFailure,
            },
        ]
    })
}

/// Match an error's message chain against the defect-signature table
///
/// Every message in the chain is tested against every signature; the first
/// match in table order wins. Returns [`ErrorCategory::Unclassified`] when
/// nothing matches.
pub fn classify<'a, I>(messages: I) -> ErrorCategory
where
    I: IntoIterator<Item = &'a str>,
{
    let messages: Vec<&str> = messages.into_iter().collect();
    for signature in signature_table() {
        for message in &messages {
            if signature.pattern.is_match(message) {
                return signature.category;
            }
        }
    }
    ErrorCategory::Unclassified
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_enum_signatures_match() {
        assert_eq!(
            classify(["unrecognized enum value 'CVSS_V4' for type Severity"]),
            ErrorCategory::UnknownEnumValue
        );
        assert_eq!(
            classify(["value \"maybe\" is not one of the values accepted"]),
            ErrorCategory::UnknownEnumValue
        );
        assert_eq!(
            classify(["unknown variant `cisaExploitAdd`"]),
            ErrorCategory::UnknownEnumValue
        );
    }

    #[test]
    fn construct_failure_signatures_match() {
        assert_eq!(
            classify(["Cannot construct instance of `CvssMetrics`"]),
            ErrorCategory::ConstructFailure
        );
        assert_eq!(
            classify(["missing required field `baseScore`"]),
            ErrorCategory::ConstructFailure
        );
    }

    #[test]
    fn unresolved_reference_signatures_match() {
        assert_eq!(
            classify(["record CVE-2024-0001 references unknown CWE-9999"]),
            ErrorCategory::UnresolvedReference
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(
            classify(["UNRECOGNIZED ENUM VALUE"]),
            ErrorCategory::UnknownEnumValue
        );
    }

    #[test]
    fn deep_cause_in_chain_is_found() {
        let chain = [
            "ingest error: store rejected batch",
            "batch write failed",
            "cannot construct instance of `Reference`",
        ];
        assert_eq!(classify(chain), ErrorCategory::ConstructFailure);
    }

    #[test]
    fn unmatched_messages_are_unclassified() {
        let category = classify(["disk quota exceeded"]);
        assert_eq!(category, ErrorCategory::Unclassified);
        assert!(!category.is_known_defect());
    }

    #[test]
    fn empty_chain_is_unclassified() {
        assert_eq!(classify([]), ErrorCategory::Unclassified);
    }
}
