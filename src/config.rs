#[derive(Clone, Debug)]
pub struct Config {
    pub sqlite_path: String,
    pub scorer_api_key: Option<String>,
    pub scorer_base: String,
    pub scorer_model: String,
    pub scorer_max_tokens: u32,
    pub scorer_timeout_secs: u64,
    pub noise_amplitude: f64,
    pub default_speed: u32,
    pub pause_poll_ms: u64,
    /// Inter-user delay when the registry reports a non-positive speed.
    pub fallback_delay_ms: u64,
    pub default_total_users: i64,
    pub default_trigger_interval: i64,
    pub event_channel_capacity: usize,
    /// Fixed RNG seed for reproducible runs; entropy-seeded when unset.
    pub rng_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./funnelsim.sqlite".to_string()),
            scorer_api_key: std::env::var("SCORER_API_KEY").ok().filter(|k| !k.is_empty()),
            scorer_base: std::env::var("SCORER_BASE").unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            scorer_model: std::env::var("SCORER_MODEL").unwrap_or_else(|_| "claude-haiku-4-5-20251001".to_string()),
            scorer_max_tokens: std::env::var("SCORER_MAX_TOKENS").ok().and_then(|v| v.parse().ok()).unwrap_or(2048),
            scorer_timeout_secs: std::env::var("SCORER_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            noise_amplitude: std::env::var("NOISE_AMPLITUDE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.08),
            default_speed: std::env::var("DEFAULT_SPEED").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            pause_poll_ms: std::env::var("PAUSE_POLL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            fallback_delay_ms: std::env::var("FALLBACK_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(200),
            default_total_users: std::env::var("TOTAL_USERS").ok().and_then(|v| v.parse().ok()).unwrap_or(500),
            default_trigger_interval: std::env::var("TRIGGER_INTERVAL").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            event_channel_capacity: std::env::var("EVENT_CHANNEL_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(256),
            rng_seed: std::env::var("RNG_SEED").ok().and_then(|v| v.parse().ok()),
        }
    }
}
