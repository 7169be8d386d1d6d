//! Label sets and their canonical string form.

use std::collections::HashMap;

/// Mapping of label names to label values.
pub type Labels = HashMap<String, String>;

/// Build a label set from key/value pairs.
///
/// ```
/// use promqtt_exporter::labels::labels;
///
/// let l = labels([("sensor", "BME280")]);
/// assert_eq!(l["sensor"], "BME280");
/// ```
pub fn labels<K, V, I>(pairs: I) -> Labels
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Convert a label set to its canonical string, the identity of a metric
/// instance.
///
/// Label names are sorted ascending and rendered as `name="value"` joined by
/// `,`. Values are not escaped, so a value containing `"` yields ambiguous
/// exposition output.
///
/// ```
/// use promqtt_exporter::labels::{canonicalize, labels};
///
/// let l = labels([("b", "2"), ("a", "1")]);
/// assert_eq!(canonicalize(&l), r#"a="1",b="2""#);
/// ```
pub fn canonicalize(labels: &Labels) -> String {
    let mut pairs: Vec<(&String, &String)> = labels.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    pairs
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `name` is a valid Prometheus label name, `[a-zA-Z_][a-zA-Z0-9_]*`.
///
/// Restricting names keeps [`canonicalize`] injective: a valid name cannot
/// contain `=`, `"` or `,`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
