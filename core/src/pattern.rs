//! Deterministic wildcard matching over dot-delimited event types.
//!
//! Subscriptions (bus handlers, webhook registrations) name the events they
//! want with patterns like `task.*` or `**`. Matching is specified here
//! exactly, segment by segment, so dispatch does not depend on any event
//! emitter library's semantics:
//!
//! - the pattern and the event type are split on `'.'`
//! - a literal segment matches only an identical segment
//! - `*` matches exactly one segment
//! - `**` matches any number of trailing segments, including zero
//! - the bare pattern `*` is accepted as an alias for `**` (match-all),
//!   because webhook registrations conventionally use `*` that way
//!
//! So `task.*` matches `task.created` but not `task.status.changed`, while
//! `task.**` matches both, and `**` matches everything.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for [`EventPattern`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid event pattern: {0}")]
pub struct ParsePatternError(String);

/// A parsed event-type pattern.
///
/// # Examples
///
/// ```
/// use taskflow_core::pattern::EventPattern;
///
/// let pattern: EventPattern = "task.*".parse().unwrap();
/// assert!(pattern.matches("task.created"));
/// assert!(!pattern.matches("task.status.changed"));
/// assert!(!pattern.matches("project.created"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    /// `*` - exactly one segment
    One,
    /// `**` - any number of trailing segments
    Rest,
}

impl EventPattern {
    /// The match-all pattern (`**`).
    #[must_use]
    pub fn match_all() -> Self {
        Self {
            raw: "**".to_string(),
            segments: vec![Segment::Rest],
        }
    }

    /// The pattern source string as registered.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `event_type` matches this pattern.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        let parts: Vec<&str> = event_type.split('.').collect();
        Self::match_segments(&self.segments, &parts)
    }

    fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
        match pattern.first() {
            None => parts.is_empty(),
            Some(Segment::Rest) => true,
            Some(Segment::One) => {
                !parts.is_empty() && Self::match_segments(&pattern[1..], &parts[1..])
            },
            Some(Segment::Literal(lit)) => {
                parts.first() == Some(&lit.as_str())
                    && Self::match_segments(&pattern[1..], &parts[1..])
            },
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for EventPattern {
    type Err = ParsePatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParsePatternError("pattern cannot be empty".to_string()));
        }

        // Bare `*` is the conventional match-all in webhook registrations.
        if s == "*" {
            return Ok(Self::match_all());
        }

        let mut segments = Vec::new();
        for (i, part) in s.split('.').enumerate() {
            let segment = match part {
                "" => {
                    return Err(ParsePatternError(format!(
                        "empty segment at position {i} in {s:?}"
                    )));
                },
                "*" => Segment::One,
                "**" => Segment::Rest,
                lit => Segment::Literal(lit.to_string()),
            };
            let is_rest = segment == Segment::Rest;
            segments.push(segment);
            if is_rest && i + 1 != s.split('.').count() {
                return Err(ParsePatternError(format!(
                    "`**` is only valid as the final segment in {s:?}"
                )));
            }
        }

        Ok(Self {
            raw: s.to_string(),
            segments,
        })
    }
}

impl TryFrom<String> for EventPattern {
    type Error = ParsePatternError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventPattern> for String {
    fn from(pattern: EventPattern) -> Self {
        pattern.raw
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(s: &str) -> EventPattern {
        s.parse().expect("pattern should parse")
    }

    #[test]
    fn exact_match() {
        assert!(pattern("task.created").matches("task.created"));
        assert!(!pattern("task.created").matches("task.updated"));
        assert!(!pattern("task.created").matches("task.created.extra"));
    }

    #[test]
    fn single_star_matches_exactly_one_segment() {
        let p = pattern("task.*");
        assert!(p.matches("task.created"));
        assert!(p.matches("task.deleted"));
        assert!(!p.matches("task"));
        assert!(!p.matches("task.status.changed"));
        assert!(!p.matches("project.created"));
    }

    #[test]
    fn star_in_the_middle() {
        let p = pattern("task.*.changed");
        assert!(p.matches("task.status.changed"));
        assert!(!p.matches("task.changed"));
        assert!(!p.matches("task.status.priority.changed"));
    }

    #[test]
    fn double_star_matches_any_suffix() {
        let p = pattern("task.**");
        assert!(p.matches("task"));
        assert!(p.matches("task.created"));
        assert!(p.matches("task.status.changed"));
        assert!(!p.matches("project.created"));
    }

    #[test]
    fn bare_star_is_match_all() {
        let p = pattern("*");
        assert!(p.matches("task.created"));
        assert!(p.matches("user.logged_in"));
        assert!(p.matches("a.b.c.d"));
        assert_eq!(p, EventPattern::match_all());
    }

    #[test]
    fn match_all_matches_everything() {
        let p = EventPattern::match_all();
        assert!(p.matches("task.created"));
        assert!(p.matches("x"));
    }

    #[test]
    fn invalid_patterns_rejected() {
        assert!("".parse::<EventPattern>().is_err());
        assert!("task..created".parse::<EventPattern>().is_err());
        assert!("task.**.created".parse::<EventPattern>().is_err());
        assert!(".task".parse::<EventPattern>().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let p = pattern("task.*");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"task.*\"");
        let back: EventPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    proptest! {
        /// A literal pattern matches exactly its own string.
        #[test]
        fn literal_patterns_match_only_themselves(
            segs in proptest::collection::vec("[a-z]{1,8}", 1..4)
        ) {
            let event_type = segs.join(".");
            let p = pattern(&event_type);
            prop_assert!(p.matches(&event_type));
            let extended = format!("{}.extra", event_type);
            prop_assert!(!p.matches(&extended));
        }

        /// Replacing any one segment with `*` still matches the original.
        #[test]
        fn single_star_generalizes_one_segment(
            segs in proptest::collection::vec("[a-z]{1,8}", 1..4),
            idx in 0usize..4,
        ) {
            let idx = idx % segs.len();
            let mut generalized = segs.clone();
            generalized[idx] = "*".to_string();
            let p = pattern(&generalized.join("."));
            prop_assert!(p.matches(&segs.join(".")));
        }

        /// `**` matches every event type.
        #[test]
        fn double_star_matches_everything(
            segs in proptest::collection::vec("[a-z]{1,8}", 1..5)
        ) {
            prop_assert!(EventPattern::match_all().matches(&segs.join(".")));
        }
    }
}
