use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Base URL of the AI service (speech, generation, evaluation).
    pub ai_service_url: String,
    /// Base URL of the local model runtime the AI service depends on.
    pub model_runtime_url: String,
    /// Base URL of the report persistence service.
    pub report_store_url: String,
    /// Command (argv) used to restart the AI service after sustained failure.
    pub ai_restart_command: Option<Vec<String>>,
    /// Sessions with no activity for this long are evicted.
    pub session_idle_timeout: Duration,
    pub short_answer_words: usize,
    pub probe_budget: u32,
    pub plan_size: usize,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// This function will look for a `.env` file in the current directory
    /// and load the following variables:
    ///
    /// *   `BIND_ADDRESS`: The address and port to bind the server to. Defaults to "0.0.0.0:3000".
    /// *   `AI_SERVICE_URL`: Base URL of the AI service. Defaults to "http://localhost:8000".
    /// *   `MODEL_RUNTIME_URL`: Base URL of the model runtime. Defaults to "http://localhost:11434".
    /// *   `REPORT_STORE_URL`: Base URL of the report persistence service. Defaults to "http://localhost:5000".
    /// *   `AI_RESTART_COMMAND`: (Optional) Shell-free argv, whitespace separated, spawned to
    ///     restart the AI service after sustained failure. Unset disables auto-restart.
    /// *   `SESSION_IDLE_TIMEOUT_SECS`: (Optional) Idle eviction threshold. Defaults to 1800.
    /// *   `SHORT_ANSWER_WORDS`: (Optional) Probe threshold in words. Defaults to 15.
    /// *   `PROBE_BUDGET`: (Optional) Maximum probes per session. Defaults to 8.
    /// *   `PLAN_SIZE`: (Optional) Questions per interview. Defaults to 7.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let ai_service_url = std::env::var("AI_SERVICE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        let model_runtime_url = std::env::var("MODEL_RUNTIME_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let report_store_url = std::env::var("REPORT_STORE_URL")
            .unwrap_or_else(|_| "http://localhost:5000".to_string());

        let ai_restart_command = std::env::var("AI_RESTART_COMMAND").ok().and_then(|raw| {
            let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() { None } else { Some(argv) }
        });

        let session_idle_timeout =
            Duration::from_secs(parse_var("SESSION_IDLE_TIMEOUT_SECS", 1800u64)?);
        let short_answer_words = parse_var("SHORT_ANSWER_WORDS", 15usize)?;
        let probe_budget = parse_var("PROBE_BUDGET", 8u32)?;
        let plan_size = parse_var("PLAN_SIZE", 7usize)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            ai_service_url,
            model_runtime_url,
            report_store_url,
            ai_restart_command,
            session_idle_timeout,
            short_answer_words,
            probe_budget,
            plan_size,
            log_level,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
