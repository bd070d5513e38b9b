use std::sync::Arc;

use common::consts::SPEND_TOTAL_PREFIX;
use common::models::Event;
use common::window::WindowUnit;
use tracing::debug;

use super::counters::{CounterError, CounterStore};
use super::validator::{rate_window_prefix, spend_window_prefix};
use crate::storage::{EventStore, StoreError};

/// Writes accounted requests: the event row plus the counters the validator
/// reads.
#[derive(Clone)]
pub struct Recorder {
    events: Arc<dyn EventStore>,
    counters: Arc<dyn CounterStore>,
}

impl Recorder {
    pub fn new(events: Arc<dyn EventStore>, counters: Arc<dyn CounterStore>) -> Self {
        Self { events, counters }
    }

    pub async fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.insert_event(event).await?;
        metrics::counter!("recorder.events").increment(1);
        debug!(event_id = %event.id, key_id = %event.key_id, "event recorded");
        Ok(())
    }

    /// Add spend to the lifetime counter and, when the key has a windowed
    /// cost limit, to the current window as well.
    pub async fn record_key_spend(
        &self,
        key_id: &str,
        micros: i64,
        unit: Option<WindowUnit>,
    ) -> Result<(), CounterError> {
        if micros == 0 {
            return Ok(());
        }
        self.counters
            .incr_by(SPEND_TOTAL_PREFIX, key_id, micros)
            .await?;
        if let Some(unit) = unit {
            self.counters
                .increment_windowed(&spend_window_prefix(unit), key_id, unit, micros)
                .await?;
        }
        Ok(())
    }

    pub async fn record_request(&self, key_id: &str, unit: WindowUnit) -> Result<i64, CounterError> {
        self.counters
            .increment_windowed(&rate_window_prefix(unit), key_id, unit, 1)
            .await
    }
}
