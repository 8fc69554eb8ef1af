use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Domain, SyncBus};

const DEFAULT_DIGEST_TIME: &str = "08:00";
const TIME_FORMAT: &str = "%H:%M";

/// Daily digest delivery time as stored: a 24-hour `HH:MM` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigestTime(String);

impl DigestTime {
    pub fn parse(value: &str) -> Result<Self, InvalidDigestTime> {
        let value = value.trim();
        let time = NaiveTime::parse_from_str(value, TIME_FORMAT)
            .map_err(|_| InvalidDigestTime(value.to_string()))?;
        Ok(Self(time.format(TIME_FORMAT).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed time of day, falling back to the default for a corrupt stored value.
    pub fn time(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.0, TIME_FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(DEFAULT_DIGEST_TIME, TIME_FORMAT))
            .unwrap_or(NaiveTime::MIN)
    }
}

impl Default for DigestTime {
    fn default() -> Self {
        Self(DEFAULT_DIGEST_TIME.to_string())
    }
}

impl std::fmt::Display for DigestTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid digest time '{0}', expected HH:MM")]
pub struct InvalidDigestTime(pub String);

pub struct DigestScheduleDomain;

impl Domain for DigestScheduleDomain {
    const KEY: &'static str = "digestScheduleTime";
    type Value = DigestTime;
}

#[derive(Clone)]
pub struct DigestScheduleStore {
    bus: SyncBus<DigestScheduleDomain>,
}

impl DigestScheduleStore {
    pub fn new(bus: SyncBus<DigestScheduleDomain>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &SyncBus<DigestScheduleDomain> {
        &self.bus
    }

    pub fn get(&self) -> DigestTime {
        self.bus.get()
    }

    pub async fn set(&self, value: &str) -> Result<DigestTime, InvalidDigestTime> {
        let time = DigestTime::parse(value)?;
        self.bus.set(time.clone()).await;
        Ok(time)
    }
}
