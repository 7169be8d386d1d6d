//! Routing of messages to mappings by topic.

use promqtt_common::TopicPattern;
use tracing::{debug, warn};

use crate::mapping::{MappingOutcome, SharedMapping};
use crate::message::{Message, ParserKind};

/// Counts from handling one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleReport {
    /// At least one topic pattern matched.
    pub matched: bool,
    /// The payload failed to parse.
    pub parse_failed: bool,
    /// Mappings that wrote or removed a value.
    pub applied: usize,
    /// Mappings whose expressions failed.
    pub skipped: usize,
    /// Mappings whose store update failed.
    pub store_errors: usize,
}

/// Binds topic patterns and a parser to a list of mappings.
#[derive(Debug)]
pub struct MessageHandler {
    patterns: Vec<TopicPattern>,
    parser: ParserKind,
    mappings: Vec<SharedMapping>,
}

impl MessageHandler {
    pub fn new(patterns: Vec<TopicPattern>, parser: ParserKind, mappings: Vec<SharedMapping>) -> Self {
        Self {
            patterns,
            parser,
            mappings,
        }
    }

    pub fn mappings(&self) -> &[SharedMapping] {
        &self.mappings
    }

    /// Whether any pattern matches the message topic.
    pub fn matches(&self, msg: &Message) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches(msg.topic(), msg.segments()))
    }

    /// Handle one message.
    ///
    /// Non-matching topics are ignored. A parse failure skips this handler
    /// for the message. Each mapping runs regardless of how the ones before
    /// it fared.
    pub fn handle(&self, msg: &Message) -> HandleReport {
        let mut report = HandleReport::default();

        if !self.matches(msg) {
            return report;
        }
        report.matched = true;

        let data = match msg.parse_with(self.parser) {
            Ok(data) => data,
            Err(e) => {
                debug!(
                    topic = %msg.topic(),
                    parser = %self.parser,
                    payload_len = msg.payload().len(),
                    error = %e,
                    "Failed to parse payload"
                );
                report.parse_failed = true;
                return report;
            }
        };

        for mapping in &self.mappings {
            match mapping.handle_msg_data(msg, data) {
                Ok(MappingOutcome::Skipped(_)) => report.skipped += 1,
                Ok(_) => report.applied += 1,
                Err(e) => {
                    warn!(
                        type_name = %mapping.type_name(),
                        metric = %mapping.metric(),
                        topic = %msg.topic(),
                        error = %e,
                        "Failed to update metric"
                    );
                    report.store_errors += 1;
                }
            }
        }

        report
    }
}
