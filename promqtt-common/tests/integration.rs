//! Integration tests for promqtt-common library.

use std::io::Write;

use promqtt_common::{LogFormat, LoggingConfig, TopicPattern, load_config, split_topic};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Settings {
    logging: LoggingConfig,
    topics: Vec<String>,
}

#[test]
fn test_load_config_from_file_and_compile_topics() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            // comments are allowed in JSON5
            logging: {{ level: "debug", format: "json" }},
            topics: ["tele/+/SENSOR", "re:^stat/.*/POWER", ],
        }}"#
    )
    .unwrap();

    let settings: Settings = load_config(file.path()).expect("config should load");
    assert_eq!(settings.logging.format, LogFormat::Json);

    let patterns: Vec<TopicPattern> = settings
        .topics
        .iter()
        .map(|t| TopicPattern::compile(t).expect("pattern should compile"))
        .collect();

    let topic = "tele/node1/SENSOR";
    let segments = split_topic(topic);
    assert!(patterns[0].matches(topic, &segments));
    assert!(!patterns[1].matches(topic, &segments));

    let topic = "stat/plug7/POWER";
    let segments = split_topic(topic);
    assert!(!patterns[0].matches(topic, &segments));
    assert!(patterns[1].matches(topic, &segments));
    assert!(patterns[1].is_regex());
}

#[test]
fn test_load_config_parse_error_names_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ logging: ").unwrap();

    let result: promqtt_common::Result<Settings> = load_config(file.path());
    let err = result.unwrap_err().to_string();
    assert!(err.contains("Failed to parse config file"), "got: {}", err);
}
