use std::sync::Arc;

use common::configuration::Configuration;

use crate::auth::Authenticator;
use crate::billing::Validator;
use crate::events::{Decorator, EventBus};
use crate::handlers::routes::ResponseCache;
use crate::policy::PolicyCache;
use crate::storage::{ConfigStore, EventStore};

/// Shared application state bundled into a single Arc-wrapped struct.
///
/// Both listeners clone one `Arc<AppState>` per connection instead of a
/// handful of component `Arc`s.
pub struct AppState {
    pub config: Arc<Configuration>,
    pub config_store: Arc<dyn ConfigStore>,
    pub event_store: Arc<dyn EventStore>,
    pub policies: Arc<PolicyCache>,
    pub authenticator: Authenticator,
    pub validator: Validator,
    /// Used on the request path for prompt cost estimates.
    pub decorator: Decorator,
    pub bus: Arc<EventBus>,
    /// Shared HTTP client for upstream requests (connection pooling / keep-alive).
    pub http_client: reqwest::Client,
    pub response_cache: ResponseCache,
}
