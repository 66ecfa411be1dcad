//! Declarative interest in events.
//!
//! Filters are what turn "who consumes what" into inspectable data: every
//! projection and every subscription declares one up front.

use serde::{Deserialize, Serialize};

use crate::EventEnvelope;

/// Name pattern: `*` matches everything, a trailing `*` matches a prefix
/// (`Trade*`, `market.*`), anything else matches exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Pattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl Pattern {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "*" | "" => Pattern::Any,
            _ => match raw.strip_suffix('*') {
                Some(prefix) => Pattern::Prefix(prefix.to_string()),
                None => Pattern::Exact(raw.to_string()),
            },
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Pattern::Exact(exact) => value == exact,
        }
    }
}

impl From<String> for Pattern {
    fn from(value: String) -> Self {
        Pattern::parse(&value)
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Pattern::parse(value)
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        value.to_string()
    }
}

impl core::fmt::Display for Pattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Prefix(p) => write!(f, "{p}*"),
            Pattern::Exact(e) => f.write_str(e),
        }
    }
}

/// Filter over `stream_type` and `event_type`.
///
/// An empty pattern list on either axis accepts every value on that axis; a
/// non-empty list accepts a value if any pattern matches it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub stream_types: Vec<Pattern>,
    #[serde(default)]
    pub event_types: Vec<Pattern>,
}

impl EventFilter {
    /// Accept every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn stream_type(pattern: impl Into<Pattern>) -> Self {
        Self::all().with_stream_type(pattern)
    }

    pub fn event_type(pattern: impl Into<Pattern>) -> Self {
        Self::all().with_event_type(pattern)
    }

    pub fn with_stream_type(mut self, pattern: impl Into<Pattern>) -> Self {
        self.stream_types.push(pattern.into());
        self
    }

    pub fn with_event_type(mut self, pattern: impl Into<Pattern>) -> Self {
        self.event_types.push(pattern.into());
        self
    }

    pub fn matches_types(&self, stream_type: &str, event_type: &str) -> bool {
        let stream_ok = self.stream_types.is_empty()
            || self.stream_types.iter().any(|p| p.matches(stream_type));
        let event_ok =
            self.event_types.is_empty() || self.event_types.iter().any(|p| p.matches(event_type));
        stream_ok && event_ok
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        self.matches_types(envelope.stream_type(), envelope.event_type())
    }
}

impl core::fmt::Display for EventFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let join = |ps: &[Pattern]| {
            if ps.is_empty() {
                "*".to_string()
            } else {
                ps.iter().map(ToString::to_string).collect::<Vec<_>>().join("|")
            }
        };
        write!(
            f,
            "stream_type={} event_type={}",
            join(&self.stream_types),
            join(&self.event_types)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_parsing() {
        assert_eq!(Pattern::parse("*"), Pattern::Any);
        assert_eq!(Pattern::parse("Trade*"), Pattern::Prefix("Trade".into()));
        assert_eq!(Pattern::parse("PortfolioCreated"), Pattern::Exact("PortfolioCreated".into()));
    }

    #[test]
    fn prefix_and_exact_matching() {
        let p = Pattern::parse("market.*");
        assert!(p.matches("market.quote"));
        assert!(!p.matches("marketquote"));
        assert!(Pattern::parse("A").matches("A"));
        assert!(!Pattern::parse("A").matches("AB"));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        assert!(EventFilter::all().matches_types("portfolio", "Anything"));
    }

    #[test]
    fn both_axes_must_match() {
        let filter = EventFilter::stream_type("portfolio").with_event_type("Trade*");
        assert!(filter.matches_types("portfolio", "TradeExecuted"));
        assert!(!filter.matches_types("portfolio", "CashDeposited"));
        assert!(!filter.matches_types("quote", "TradeExecuted"));
    }

    #[test]
    fn any_pattern_on_an_axis_is_enough() {
        let filter = EventFilter::event_type("CashDeposited").with_event_type("CashWithdrawn");
        assert!(filter.matches_types("portfolio", "CashWithdrawn"));
    }

    #[test]
    fn filter_serializes_patterns_as_strings() {
        let filter = EventFilter::stream_type("portfolio").with_event_type("Trade*");
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["event_types"][0], "Trade*");
        let back: EventFilter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }
}
