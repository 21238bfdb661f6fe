use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Límites y tiempos de la máquina de estados de reproducción.
///
/// Es la única parte de la configuración que ve el núcleo; el resto
/// (token, rutas) pertenece al arranque del bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlaybackConfig {
    pub max_queue_size: usize,
    pub max_history_size: usize,
    pub resolve_timeout: Duration,
    /// Fallos de resolución consecutivos antes de rendirse con la cola
    pub retry_ceiling: usize,
    pub keepalive_interval: Duration,
    pub idle_leave_grace: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Tiempo total de espera acumulado entre intentos de reconexión
    pub reconnect_budget: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_history_size: 50,
            resolve_timeout: Duration::from_secs(30),
            retry_ceiling: 3,
            keepalive_interval: Duration::from_secs(240), // 4 minutos
            idle_leave_grace: Duration::from_secs(300),
            reconnect_max_attempts: 5,
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_budget: Duration::from_secs(120),
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_history_size == 0 {
            anyhow::bail!("Max history size must be greater than 0");
        }

        if self.retry_ceiling == 0 {
            anyhow::bail!("Resolve retry ceiling must be greater than 0");
        }

        if self.resolve_timeout.is_zero() || self.keepalive_interval.is_zero() {
            anyhow::bail!("Resolve timeout and keep-alive interval must be non-zero");
        }

        if self.reconnect_base_delay.is_zero() {
            anyhow::bail!("Reconnect base delay must be non-zero");
        }

        if self.reconnect_base_delay > self.reconnect_max_delay {
            anyhow::bail!(
                "Reconnect base delay ({:?}) cannot exceed max delay ({:?})",
                self.reconnect_base_delay,
                self.reconnect_max_delay
            );
        }

        if self.reconnect_budget < self.reconnect_base_delay {
            anyhow::bail!("Reconnect budget is smaller than a single backoff step");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Paths
    pub data_dir: PathBuf,
    pub persist_state: bool,

    // Reproducción
    pub playback: PlaybackConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = PlaybackConfig::default();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),
            persist_state: std::env::var("PERSIST_STATE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            playback: PlaybackConfig {
                max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                    .unwrap_or_else(|_| defaults.max_queue_size.to_string())
                    .parse()?,
                max_history_size: std::env::var("MAX_HISTORY_SIZE")
                    .unwrap_or_else(|_| defaults.max_history_size.to_string())
                    .parse()?,
                resolve_timeout: duration_var("RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
                retry_ceiling: std::env::var("RESOLVE_RETRY_CEILING")
                    .unwrap_or_else(|_| defaults.retry_ceiling.to_string())
                    .parse()?,
                keepalive_interval: duration_var("KEEPALIVE_INTERVAL", defaults.keepalive_interval)?,
                idle_leave_grace: duration_var("IDLE_LEAVE_GRACE", defaults.idle_leave_grace)?,
                reconnect_max_attempts: std::env::var("RECONNECT_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| defaults.reconnect_max_attempts.to_string())
                    .parse()?,
                reconnect_base_delay: duration_var("RECONNECT_BASE_DELAY", defaults.reconnect_base_delay)?,
                reconnect_max_delay: duration_var("RECONNECT_MAX_DELAY", defaults.reconnect_max_delay)?,
                reconnect_budget: duration_var("RECONNECT_BUDGET", defaults.reconnect_budget)?,
            },
        };

        // Create directories if they don't exist
        if config.persist_state {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Queue and history bounds must be greater than 0
    /// - Backoff base delay must not exceed the max delay
    /// - Reconnect budget must fit at least one backoff step
    ///
    /// # Returns
    ///
    /// - `Ok(())`: All values are valid
    /// - `Err(anyhow::Error)`: Invalid configuration detected
    pub fn validate(&self) -> Result<()> {
        self.playback.validate()?;

        if self.persist_state && self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("DATA_DIR must be set when state persistence is enabled");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token.
    pub fn summary(&self) -> String {
        let playback = &self.playback;
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Queue: {} max, {} history\n  \
            Resolve: {} timeout, {} consecutive failures\n  \
            Voice: keep-alive {}, idle leave {}\n  \
            Reconnect: {} attempts, {}..{} backoff, {} budget\n  \
            Persistence: {} ({})",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            playback.max_queue_size,
            playback.max_history_size,
            humantime::format_duration(playback.resolve_timeout),
            playback.retry_ceiling,
            humantime::format_duration(playback.keepalive_interval),
            humantime::format_duration(playback.idle_leave_grace),
            playback.reconnect_max_attempts,
            humantime::format_duration(playback.reconnect_base_delay),
            humantime::format_duration(playback.reconnect_max_delay),
            humantime::format_duration(playback.reconnect_budget),
            self.persist_state,
            self.data_dir.display(),
        )
    }
}

/// Lee una duración en formato humano (`30s`, `4m`, `1h 30m`)
fn duration_var(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => humantime::parse_duration(value.trim())
            .map_err(|e| anyhow::anyhow!("{} inválido ({}): {}", key, value, e)),
        _ => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            // Path defaults
            data_dir: "/app/data".into(),
            persist_state: true,

            playback: PlaybackConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::default().summary().contains("100 max"));
    }

    #[test]
    fn test_rejects_zero_queue() {
        let mut config = Config::default();
        config.playback.max_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.playback.reconnect_base_delay = Duration::from_secs(60);
        config.playback.reconnect_max_delay = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_var_parses_humantime() {
        std::env::set_var("OPEN_MUSIC_TEST_DURATION", "1m 30s");
        assert_eq!(
            duration_var("OPEN_MUSIC_TEST_DURATION", Duration::ZERO).unwrap(),
            Duration::from_secs(90)
        );

        std::env::set_var("OPEN_MUSIC_TEST_DURATION", "soon");
        assert!(duration_var("OPEN_MUSIC_TEST_DURATION", Duration::ZERO).is_err());

        std::env::remove_var("OPEN_MUSIC_TEST_DURATION");
        assert_eq!(
            duration_var("OPEN_MUSIC_TEST_DURATION", Duration::from_secs(5)).unwrap(),
            Duration::from_secs(5)
        );
    }
}
