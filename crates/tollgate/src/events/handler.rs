use std::sync::Arc;

use async_trait::async_trait;
use common::consts::MICROS_PER_USD;
use common::models::{Event, Key};
use tracing::{debug, error, warn};

use super::consumer::MessageHandler;
use super::decorator::Decorator;
use super::{EventWithRequestAndContent, Message};
use crate::billing::{AccessCache, PolicyViolation, Recorder, Validator};
use crate::policy::PolicyCache;

/// Consumer-side accounting: price the request, charge the key, re-check its
/// limits and persist the event.
pub struct AccountingHandler {
    decorator: Decorator,
    recorder: Recorder,
    validator: Validator,
    access: Arc<dyn AccessCache>,
    policies: Arc<PolicyCache>,
}

impl AccountingHandler {
    pub fn new(
        decorator: Decorator,
        recorder: Recorder,
        validator: Validator,
        access: Arc<dyn AccessCache>,
        policies: Arc<PolicyCache>,
    ) -> Self {
        Self {
            decorator,
            recorder,
            validator,
            access,
            policies,
        }
    }

    pub async fn account(&self, content: &EventWithRequestAndContent) -> Event {
        let event = self.decorator.decorate(content);
        let key = &content.key;

        let micros = (event.cost_in_usd * MICROS_PER_USD).round() as i64;
        if let Err(e) = self
            .recorder
            .record_key_spend(&key.key_id, micros, key.cost_limit_in_usd_unit)
            .await
        {
            consumer_error("record_key_spend");
            error!(key_id = %key.key_id, micros, error = %e, "failed to record key spend");
        }

        if let Some(unit) = key.rate_limit_unit {
            if let Err(e) = self.recorder.record_request(&key.key_id, unit).await {
                consumer_error("record_request");
                error!(key_id = %key.key_id, error = %e, "failed to count request");
            }
        }

        self.enforce(key).await;

        if let Err(e) = self.recorder.record_event(&event).await {
            consumer_error("record_event");
            error!(event_id = %event.id, error = %e, "failed to persist event");
        }
        event
    }

    /// Re-validate with the fresh counters so the next request is refused
    /// without a full counter read.
    async fn enforce(&self, key: &Key) {
        match self.validator.validate_fresh(key, 0.0).await {
            Ok(()) => {}
            Err(PolicyViolation::Expired) => {
                if let Err(e) = self.policies.revoke_key(key, "ttl").await {
                    consumer_error("revoke_key");
                    error!(key_id = %key.key_id, error = %e, "failed to revoke expired key");
                }
            }
            Err(violation) => match violation.block(key) {
                Some((kind, unit)) => {
                    debug!(key_id = %key.key_id, kind = %kind, unit = %unit, "key over quota, marking blocked");
                    if let Err(e) = self.access.set(&key.key_id, kind, unit).await {
                        consumer_error("access_set");
                        warn!(key_id = %key.key_id, error = %e, "failed to set access marker");
                    }
                }
                None => debug!(key_id = %key.key_id, %violation, "key over a limit without a window"),
            },
        }
    }
}

fn consumer_error(step: &'static str) {
    metrics::counter!("consumer.errors", "step" => step).increment(1);
}

#[async_trait]
impl MessageHandler for AccountingHandler {
    async fn handle(&self, message: Arc<Message>) {
        match &*message {
            Message::Event(event) => {
                if let Err(e) = self.recorder.record_event(event).await {
                    consumer_error("record_event");
                    error!(event_id = %event.id, error = %e, "failed to persist event");
                }
            }
            Message::RequestContent(content) => {
                self.account(content).await;
            }
        }
    }
}
