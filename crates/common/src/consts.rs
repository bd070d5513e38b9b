pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CUSTOM_EVENT_ID_HEADER: &str = "x-custom-event-id";

pub const API_KEY_HEADER: &str = "x-api-key";
pub const AZURE_API_KEY_HEADER: &str = "api-key";

pub const OPENAI_PROVIDER: &str = "openai";
pub const AZURE_PROVIDER: &str = "azure";
pub const ANTHROPIC_PROVIDER: &str = "anthropic";

pub const OPENAI_PREFIX: &str = "/api/providers/openai";
pub const AZURE_PREFIX: &str = "/api/providers/azure/openai";
pub const ANTHROPIC_PREFIX: &str = "/api/providers/anthropic";
pub const ROUTES_PREFIX: &str = "/api/routes";
pub const CUSTOM_PROVIDERS_PREFIX: &str = "/api/custom/providers";

pub const HEALTH_PATH: &str = "/api/health";

/// Counter prefix for lifetime spend in micro-dollars.
pub const SPEND_TOTAL_PREFIX: &str = "spend-total";
/// Counter prefix for windowed spend; suffixed with the window unit.
pub const SPEND_WINDOW_PREFIX: &str = "spend";
/// Counter prefix for the windowed request rate; suffixed with the window unit.
pub const RATE_WINDOW_PREFIX: &str = "rate";

pub const DEFAULT_STREAM_END_WORD: &str = "[DONE]";
pub const MICROS_PER_USD: f64 = 1_000_000.0;
