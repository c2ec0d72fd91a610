//! Execution Timeline
//!
//! Records when each node execution starts and finishes, for run reports
//! and Gantt charts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::execution::status::ExecutionStatus;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Node execution moved to RUNNING
    Started,
    /// Node execution reached a final status
    Finished(ExecutionStatus),
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub node_execution_id: String,
    /// Plan node identifier, used as the chart label
    pub identifier: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Start/end offsets of one node execution, in ms since the timeline began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpan {
    pub identifier: String,
    pub start_ms: u128,
    pub end_ms: Option<u128>,
    pub status: Option<ExecutionStatus>,
}

impl NodeSpan {
    pub fn duration_ms(&self) -> Option<u128> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }
}

/// Timeline of one engine's node executions.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(
        &mut self,
        node_execution_id: impl Into<String>,
        identifier: impl Into<String>,
        event_type: EventType,
    ) {
        self.events.push(TimelineEvent {
            node_execution_id: node_execution_id.into(),
            identifier: identifier.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Folds the events into one span per node execution, ordered by start.
    ///
    /// Finish events without a matching start are ignored.
    pub fn spans(&self) -> Vec<(String, NodeSpan)> {
        let mut order: Vec<String> = Vec::new();
        let mut spans: HashMap<String, NodeSpan> = HashMap::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    if !spans.contains_key(&event.node_execution_id) {
                        order.push(event.node_execution_id.clone());
                    }
                    spans.insert(
                        event.node_execution_id.clone(),
                        NodeSpan {
                            identifier: event.identifier.clone(),
                            start_ms: offset,
                            end_ms: None,
                            status: None,
                        },
                    );
                }
                EventType::Finished(status) => {
                    if let Some(span) = spans.get_mut(&event.node_execution_id) {
                        span.end_ms = Some(offset);
                        span.status = Some(status);
                    }
                }
            }
        }

        let mut result: Vec<(String, NodeSpan)> = order
            .into_iter()
            .filter_map(|id| spans.remove(&id).map(|span| (id, span)))
            .collect();
        result.sort_by_key(|(_, span)| span.start_ms);
        result
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Each finished node execution is shown as a bar relative to the total
    /// run time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (_, span) in self.spans() {
            let Some(duration_ms) = span.duration_ms() else {
                continue;
            };

            let start_pos = (span.start_ms as f64 * scale) as usize;
            let width = (duration_ms as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} |{}| ({} ms)\n",
                truncate(&span.identifier, 12),
                bar,
                duration_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns node execution durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(id, span)| span.duration_ms().map(|ms| (id, ms)))
            .collect()
    }
}

/// Truncates a string to a maximum length, adding ellipsis if needed.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_spans_pair_start_and_finish() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("ne1", "build", EventType::Started);
        thread::sleep(Duration::from_millis(5));
        timeline.add_event("ne1", "build", EventType::Finished(ExecutionStatus::Succeeded));
        timeline.add_event("ne2", "test", EventType::Started);

        let spans = timeline.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].0, "ne1");
        assert_eq!(spans[0].1.status, Some(ExecutionStatus::Succeeded));
        assert!(spans[0].1.duration_ms().unwrap() >= 5);
        assert!(spans[1].1.end_ms.is_none());
    }

    #[test]
    fn test_same_identifier_kept_apart() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("ne1", "build", EventType::Started);
        timeline.add_event("ne1", "build", EventType::Finished(ExecutionStatus::Failed));
        timeline.add_event("ne2", "build", EventType::Started);
        timeline.add_event("ne2", "build", EventType::Finished(ExecutionStatus::Succeeded));

        let durations = timeline.get_durations();
        assert_eq!(durations.len(), 2);
    }

    #[test]
    fn test_finish_without_start_ignored() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("ghost", "x", EventType::Finished(ExecutionStatus::Errored));
        assert!(timeline.spans().is_empty());
        assert_eq!(timeline.get_events().len(), 1);
    }

    #[test]
    fn test_gantt_chart_lists_finished_nodes() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("ne1", "a-very-long-identifier", EventType::Started);
        thread::sleep(Duration::from_millis(2));
        timeline.add_event("ne1", "a-very-long-identifier", EventType::Finished(ExecutionStatus::Succeeded));
        thread::sleep(Duration::from_millis(1));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("Execution Timeline"));
        assert!(chart.contains("a-very-lo..."));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 12), "short");
        assert_eq!(truncate("exactly12chr", 12), "exactly12chr");
        assert_eq!(truncate("this is too long", 10), "this is...");
    }
}
