//! Extraction of one metric value from a message.

use std::sync::Arc;

use promqtt_exporter::{ExporterError, Labels, SharedStore, is_valid_label_name};
use serde_json::Value;
use tracing::{debug, trace};

use crate::expr::{Context, EvalError, Expr, Template, to_label_value, to_metric_value};
use crate::message::Message;

/// What a mapping did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingOutcome {
    /// A value was written.
    Set(f64),
    /// The value evaluated to null and the instance was removed.
    Removed,
    /// Value or label evaluation failed; nothing was written.
    Skipped(EvalError),
}

/// Binds a value expression and label expressions to one metric.
#[derive(Debug)]
pub struct Mapping {
    type_name: String,
    metric: String,
    value: Expr,
    labels: Vec<(Template, Expr)>,
    store: SharedStore,
}

pub type SharedMapping = Arc<Mapping>;

impl Mapping {
    pub fn new(
        type_name: impl Into<String>,
        metric: impl Into<String>,
        value: Expr,
        labels: Vec<(Template, Expr)>,
        store: SharedStore,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            metric: metric.into(),
            value,
            labels,
            store,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Evaluate against a message whose payload is already parsed and write
    /// the result to the store.
    ///
    /// Evaluation failures are expected as device payloads vary; they are
    /// logged at debug and reported as [`MappingOutcome::Skipped`]. Only a
    /// store error is returned as `Err`.
    pub fn handle_msg_data(
        &self,
        msg: &Message,
        data: &Value,
    ) -> Result<MappingOutcome, ExporterError> {
        let ctx = msg.context(data);

        let (value, labels) = match self.evaluate(&ctx) {
            Ok(result) => result,
            Err(e) => {
                debug!(
                    type_name = %self.type_name,
                    metric = %self.metric,
                    value = %self.value,
                    topic = %msg.topic(),
                    error = %e,
                    "Mapping skipped"
                );
                return Ok(MappingOutcome::Skipped(e));
            }
        };

        self.store.set(&self.metric, &labels, value)?;
        trace!(metric = %self.metric, ?value, "Mapping applied");

        Ok(match value {
            Some(v) => MappingOutcome::Set(v),
            None => MappingOutcome::Removed,
        })
    }

    /// Evaluate the value and every label. Any failure abandons the whole
    /// mapping so labels are never applied partially.
    fn evaluate(&self, ctx: &Context<'_>) -> Result<(Option<f64>, Labels), EvalError> {
        let value = to_metric_value(self.value.eval(ctx)?.as_ref())?;

        let mut labels = Labels::with_capacity(self.labels.len());
        for (name, expr) in &self.labels {
            let name = name.render(ctx)?;
            if !is_valid_label_name(&name) {
                return Err(EvalError::InvalidLabelName(name));
            }
            let value = to_label_value(expr.eval(ctx)?.as_ref())?;
            labels.insert(name, value);
        }

        Ok((value, labels))
    }
}
