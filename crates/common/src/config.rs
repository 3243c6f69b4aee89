use std::{env, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub secret_key: String,
    pub base_url: Url,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: Url,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: i64,
}

/// Parameters of the orchestration core.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub quote_asset: String,
    pub confidence_threshold: f64,
    pub signal_max_age: Duration,
    pub interval: String,
    pub resume_attempts: u32,
    pub resume_backoff: Duration,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            quote_asset: "BTC".to_string(),
            confidence_threshold: 0.998,
            signal_max_age: Duration::from_secs(15 * 60),
            interval: "1m".to_string(),
            resume_attempts: 3,
            resume_backoff: Duration::from_millis(1000),
        }
    }
}

/// Parameters of the default spot session. Ratios are multipliers, so a
/// take profit of 2% is stored as 1.02.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub take_profit: f64,
    pub partial_take_profit: f64,
    pub stop_limit: f64,
    pub trailing_stop: f64,
    pub max_balance: f64,
    pub sell_persistence: u32,
    pub state_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TraderConfig {
    pub exchange: ExchangeConfig,
    pub feed: FeedConfig,
    pub telegram: Option<TelegramConfig>,
    pub trading: TradingConfig,
    pub strategy: StrategyConfig,
    pub shutdown_timeout: Duration,
    pub keyboard_control: bool,
}

impl TraderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = TradingConfig::default();

        let exchange = ExchangeConfig {
            api_key: vars.required("BINANCE_API_KEY")?,
            secret_key: vars.required("BINANCE_SECRET_KEY")?,
            base_url: vars.parse_str_or("BINANCE_BASE_URL", "https://api.binance.com")?,
        };

        let feed = FeedConfig {
            url: vars.parse_str_or("SIGNAL_FEED_URL", "wss://market-scanner.herokuapp.com")?,
            max_attempts: vars.parse_or("FEED_MAX_ATTEMPTS", || 10)?,
            reconnect_delay: Duration::from_secs(vars.parse_or("FEED_RECONNECT_SECS", || 5)?),
        };

        let telegram = match (lookup("TELEGRAM_BOT_TOKEN"), lookup("TELEGRAM_CHAT_ID")) {
            (Some(token), Some(_)) => Some(TelegramConfig {
                token,
                chat_id: vars.parse_or("TELEGRAM_CHAT_ID", || 0)?,
            }),
            _ => None,
        };

        let confidence_threshold: f64 =
            vars.parse_or("CONFIDENCE_THRESHOLD", || defaults.confidence_threshold)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::Invalid {
                key: "CONFIDENCE_THRESHOLD",
                value: confidence_threshold.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }

        let trading = TradingConfig {
            quote_asset: vars
                .parse_or("QUOTE_ASSET", || defaults.quote_asset.clone())?
                .trim()
                .to_uppercase(),
            confidence_threshold,
            signal_max_age: Duration::from_secs(vars.parse_or("SIGNAL_MAX_AGE_SECS", || 900)?),
            interval: vars.parse_or("CANDLE_INTERVAL", || defaults.interval.clone())?,
            resume_attempts: vars.parse_or("RESUME_ATTEMPTS", || defaults.resume_attempts)?.max(1),
            resume_backoff: Duration::from_millis(vars.parse_or("RESUME_BACKOFF_MS", || 1000)?),
        };

        let strategy = StrategyConfig {
            take_profit: percent_to_ratio(vars.parse_or("TAKE_PROFIT", || 2.0)?),
            partial_take_profit: percent_to_ratio(vars.parse_or("PARTIAL_TP", || 1.0)?),
            stop_limit: percent_to_ratio(vars.parse_or("STOP_LIMIT", || -3.0)?),
            trailing_stop: percent_to_ratio(vars.parse_or("TRAILING_SL", || -1.0)?),
            max_balance: vars.parse_or("MAX_BALANCE", || 0.001)?,
            sell_persistence: vars.parse_or("SELL_PERSISTENCE", || 3)?,
            state_file: vars.parse_or("STATE_FILE", || PathBuf::from("trader_state.json"))?,
        };

        Ok(Self {
            exchange,
            feed,
            telegram,
            trading,
            strategy,
            shutdown_timeout: Duration::from_secs(vars.parse_or("SHUTDOWN_TIMEOUT_SECS", || 10)?),
            keyboard_control: vars.parse_or("KEYBOARD_CONTROL", || true)?,
        })
    }
}

pub fn percent_to_ratio(pct: f64) -> f64 {
    pct / 100.0 + 1.0
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        (self.0)(key)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(key))
    }

    fn parse_str_or<T>(&self, key: &'static str, default: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = (self.0)(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string());
        value.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        })
    }

    fn parse_or<T, D>(&self, key: &'static str, default: D) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
        D: FnOnce() -> T,
    {
        match (self.0)(key) {
            Some(value) if !value.is_empty() => {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })
            }
            _ => Ok(default()),
        }
    }
}
