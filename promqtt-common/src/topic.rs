//! MQTT topic splitting and topic pattern matching.
//!
//! Patterns come in two flavours:
//!
//! - Segment patterns such as `tele/+/SENSOR`. The pattern must have the same
//!   number of `/`-separated segments as the topic and every segment either is
//!   the single-level wildcard `+` or equals the topic segment.
//! - Regular expressions prefixed with `re:`, e.g. `re:^sensors/.*`. The
//!   expression is matched against the start of the full topic string.
//!
//! The multi-level wildcard `#` is only meaningful for broker subscriptions and
//! is compared literally here.

use std::fmt;

use regex::Regex;
use thiserror::Error;

/// Prefix marking a topic pattern as a regular expression.
pub const REGEX_PREFIX: &str = "re:";

/// Single-level wildcard segment.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Topic pattern errors.
#[derive(Debug, Error)]
pub enum TopicError {
    #[error("invalid regular expression in topic pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Split a topic into its path segments.
///
/// # Example
/// ```
/// use promqtt_common::topic::split_topic;
///
/// assert_eq!(split_topic("tele/node1/SENSOR"), vec!["tele", "node1", "SENSOR"]);
/// ```
pub fn split_topic(topic: &str) -> Vec<String> {
    topic.split('/').map(str::to_string).collect()
}

/// A compiled topic pattern.
#[derive(Debug, Clone)]
pub enum TopicPattern {
    /// Literal segments, `+` matching any single segment.
    Segments(Vec<String>),
    /// Regular expression anchored at the start of the topic.
    Regex { source: String, regex: Regex },
}

impl TopicPattern {
    /// Compile a pattern string.
    ///
    /// Fails only for `re:` patterns whose expression does not compile.
    pub fn compile(pattern: &str) -> Result<Self, TopicError> {
        match pattern.strip_prefix(REGEX_PREFIX) {
            Some(expr) => {
                let regex = Regex::new(&format!("^(?:{})", expr)).map_err(|source| {
                    TopicError::InvalidRegex {
                        pattern: pattern.to_string(),
                        source,
                    }
                })?;
                Ok(TopicPattern::Regex {
                    source: pattern.to_string(),
                    regex,
                })
            }
            None => Ok(TopicPattern::Segments(split_topic(pattern))),
        }
    }

    /// Check whether a topic matches this pattern.
    ///
    /// `topic` is the full topic string and `segments` its split form; both are
    /// passed so callers holding a pre-split topic avoid re-splitting.
    pub fn matches<S: AsRef<str>>(&self, topic: &str, segments: &[S]) -> bool {
        match self {
            TopicPattern::Regex { regex, .. } => regex.is_match(topic),
            TopicPattern::Segments(parts) => {
                parts.len() == segments.len()
                    && parts.iter().zip(segments).all(|(part, segment)| {
                        part == SINGLE_LEVEL_WILDCARD || part == segment.as_ref()
                    })
            }
        }
    }

    /// Check whether this is a regular expression pattern.
    pub fn is_regex(&self) -> bool {
        matches!(self, TopicPattern::Regex { .. })
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Segments(parts) => f.write_str(&parts.join("/")),
            TopicPattern::Regex { source, .. } => f.write_str(source),
        }
    }
}

/// Match a pattern string against a topic given as segments.
///
/// Compiles the pattern on every call. Hot paths should compile once with
/// [`TopicPattern::compile`] instead.
///
/// # Example
/// ```
/// use promqtt_common::topic::matches;
///
/// assert!(matches("a/+/c", &["a", "b", "c"]).unwrap());
/// assert!(!matches("a/b", &["a", "b", "c"]).unwrap());
/// ```
pub fn matches<S: AsRef<str>>(pattern: &str, topic_segments: &[S]) -> Result<bool, TopicError> {
    let topic = topic_segments
        .iter()
        .map(|segment| segment.as_ref())
        .collect::<Vec<&str>>()
        .join("/");
    Ok(TopicPattern::compile(pattern)?.matches(&topic, topic_segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_topic() {
        assert_eq!(split_topic("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_topic("single"), vec!["single"]);
        assert_eq!(split_topic("/leading"), vec!["", "leading"]);
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/+/c", &["a", "b", "c"]).unwrap());
        assert!(!matches("a/+/c", &["a", "b", "d"]).unwrap());
    }

    #[test]
    fn test_segment_count_mismatch() {
        assert!(!matches("a/b", &["a", "b", "c"]).unwrap());
        assert!(!matches("a/b/c/d", &["a", "b", "c"]).unwrap());
    }

    #[test]
    fn test_literal_match() {
        assert!(matches("tele/node1/SENSOR", &["tele", "node1", "SENSOR"]).unwrap());
        assert!(!matches("tele/node1/SENSOR", &["tele", "node1", "STATE"]).unwrap());
    }

    #[test]
    fn test_hash_is_literal() {
        assert!(!matches("a/#", &["a", "b"]).unwrap());
        assert!(matches("a/#", &["a", "#"]).unwrap());
    }

    #[test]
    fn test_regex_pattern() {
        assert!(matches("re:^sensors/.*", &["sensors", "x", "y"]).unwrap());
        assert!(!matches("re:^sensors/.*", &["actors", "x"]).unwrap());
    }

    #[test]
    fn test_regex_is_anchored_at_start() {
        let pattern = TopicPattern::compile("re:node[0-9]+").unwrap();
        let topic = "tele/node1/SENSOR";
        let segments = split_topic(topic);

        assert!(!pattern.matches(topic, &segments));
        assert!(pattern.matches("node1/SENSOR", &split_topic("node1/SENSOR")));
    }

    #[test]
    fn test_invalid_regex() {
        let result = TopicPattern::compile("re:([unclosed");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("re:([unclosed")
        );
    }

    #[test]
    fn test_display_roundtrips_source() {
        assert_eq!(
            TopicPattern::compile("tele/+/SENSOR").unwrap().to_string(),
            "tele/+/SENSOR"
        );
        assert_eq!(
            TopicPattern::compile("re:^x/.*").unwrap().to_string(),
            "re:^x/.*"
        );
    }
}
