//! In-memory Prometheus metric store with per-metric staleness expiry.
//!
//! Metrics are registered once by name, then updated with labeled values from
//! any thread. A scrape renders the whole store in the text exposition format,
//! dropping instances that were not updated within their metric's timeout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  set()   ┌──────────────────────────────┐  render()  ┌─────────────┐
//! │   Mappings   │─────────>│ MetricStore (one mutex)      │<───────────│ HTTP scrape │
//! └──────────────┘          │  Metric ── MetricInstance    │            └─────────────┘
//!                           └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use promqtt_exporter::{MetricDescriptor, MetricStore, labels::labels};
//!
//! let store = MetricStore::new();
//! store.register(MetricDescriptor::gauge("temp", "Temp").with_timeout_secs(300))?;
//! store.set("temp", &labels([("sensor", "BME280")]), Some(25.5))?;
//!
//! assert!(store.render().contains("temp{sensor=\"BME280\"} 25.5"));
//! # Ok::<(), promqtt_exporter::ExporterError>(())
//! ```

pub mod clock;
pub mod error;
pub mod instance;
pub mod labels;
pub mod metric;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ExporterError, Result};
pub use instance::{MetricInstance, format_value};
pub use labels::{Labels, canonicalize, is_valid_label_name};
pub use metric::{Metric, MetricDescriptor, MetricType};
pub use store::{InstanceSnapshot, MetricSnapshot, MetricStore, SharedStore, StoreStats};
