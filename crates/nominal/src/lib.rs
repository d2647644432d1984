use std::{env, error};

use async_trait::async_trait;
use chrono_tz::Tz;
use model::Trip;
use utility::time::parse_day_seconds;

pub mod otp;

pub use otp::OtpAdapter;

#[derive(Debug)]
pub enum AdapterError {
    Configuration(String),
    Request(reqwest::Error),
    InvalidResponse(String),
    Other(Box<dyn error::Error + Send + Sync>),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Configuration(why) => write!(f, "adapter configuration error: {}", why),
            Self::Request(why) => write!(f, "schedule source request failed: {}", why),
            Self::InvalidResponse(why) => write!(f, "invalid schedule source response: {}", why),
            Self::Other(why) => write!(f, "{}", why),
        }
    }
}

impl error::Error for AdapterError {}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Resolution of scheduled times into operating-day fields: the operating
/// day may extend past midnight up to the configured end (27:00:00 by
/// default, i.e. 03:00 the next morning).
#[derive(Debug, Clone, Copy)]
pub struct OperatingDayConfig {
    pub timezone: Tz,
    pub day_end_seconds: i64,
}

impl OperatingDayConfig {
    pub fn from_env() -> Result<Self> {
        let timezone: Tz = env::var("A2G_TIMEZONE")
            .unwrap_or_else(|_| "Europe/Berlin".to_owned())
            .parse::<Tz>()
            .map_err(|why| AdapterError::Configuration(why.to_string()))?;

        let day_end = env::var("A2G_OPERATING_DAY_END").unwrap_or_else(|_| "27:00:00".to_owned());
        let day_end_seconds = parse_day_seconds(&day_end).ok_or_else(|| {
            AdapterError::Configuration(format!("invalid operating day end: {}", day_end))
        })?;

        Ok(Self {
            timezone,
            day_end_seconds,
        })
    }
}

/// A source of nominal trip candidates near a coordinate. Implementations
/// materialize complete trips: full stop times in epoch seconds, an encoded
/// shape polyline and an operating-day descriptor.
#[async_trait]
pub trait NominalAdapter: Send + Sync {
    async fn get_trip_candidates(&self, latitude: f64, longitude: f64) -> Result<Vec<Trip>>;
}

/// Wraps the configured adapter and degrades all failures to an empty
/// candidate list; the caller may fall back to cached candidates.
pub struct NominalClient {
    adapter_type: String,
    adapter: Box<dyn NominalAdapter>,
}

impl NominalClient {
    pub fn from_env() -> Result<Self> {
        let adapter_type = env::var("A2G_NOMINAL_ADAPTER_TYPE")
            .map_err(|_| AdapterError::Configuration("A2G_NOMINAL_ADAPTER_TYPE is not set".to_owned()))?;
        let adapter_config = env::var("A2G_NOMINAL_ADAPTER_CONFIG")
            .map_err(|_| AdapterError::Configuration("A2G_NOMINAL_ADAPTER_CONFIG is not set".to_owned()))?;

        let adapter: Box<dyn NominalAdapter> = match adapter_type.as_str() {
            "otp" => {
                let config = serde_json::from_str(&adapter_config)
                    .map_err(|why| AdapterError::Configuration(why.to_string()))?;
                Box::new(OtpAdapter::new(config, OperatingDayConfig::from_env()?))
            }
            other => {
                return Err(AdapterError::Configuration(format!(
                    "unknown nominal adapter type {}",
                    other
                )))
            }
        };

        Ok(Self {
            adapter_type,
            adapter,
        })
    }

    pub fn new(adapter_type: impl Into<String>, adapter: Box<dyn NominalAdapter>) -> Self {
        Self {
            adapter_type: adapter_type.into(),
            adapter,
        }
    }

    pub async fn get_trip_candidates(&self, latitude: f64, longitude: f64) -> Vec<Trip> {
        log::info!(
            "NominalClient: loading trip candidates with adapter of type {}",
            self.adapter_type
        );

        match self.adapter.get_trip_candidates(latitude, longitude).await {
            Ok(candidates) => candidates,
            Err(why) => {
                log::error!("NominalClient: {}", why);
                Vec::new()
            }
        }
    }
}
