//! Monitoring
//!
//! Execution timeline of a run, used for the CLI report and Gantt chart.

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, NodeSpan, TimelineEvent};
