//! Core domain model and local-midnight detection for Daymark.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "daymark-core";

pub type EntityId = Uuid;

/// Registry row: an entity plus its raw, not yet validated IANA zone name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTimezone {
    pub entity_id: EntityId,
    pub timezone: String,
}

impl EntityTimezone {
    pub fn new(entity_id: EntityId, timezone: impl Into<String>) -> Self {
        Self {
            entity_id,
            timezone: timezone.into(),
        }
    }
}

/// One entity that crossed into `local_date` during the current tick window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerCandidate {
    pub entity_id: EntityId,
    pub local_date: NaiveDate,
}

/// Persisted proof that `(entity_id, local_date)` has already been triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub entity_id: EntityId,
    pub local_date: NaiveDate,
    pub triggered_at: DateTime<Utc>,
}

/// Parameters forwarded verbatim to the downstream sessionizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionizeParams {
    pub gap_threshold_minutes: u32,
    pub lookback_hours: u32,
}

impl Default for SessionizeParams {
    fn default() -> Self {
        Self {
            gap_threshold_minutes: 10,
            lookback_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimezoneError {
    #[error("timezone is empty")]
    Empty,
    #[error("unknown IANA timezone '{0}'")]
    Unknown(String),
}

/// Parse an IANA zone name against the bundled tz database.
pub fn parse_timezone(raw: &str) -> Result<Tz, TimezoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TimezoneError::Empty);
    }
    trimmed
        .parse::<Tz>()
        .map_err(|_| TimezoneError::Unknown(trimmed.to_string()))
}

/// Civil date of `instant` in `tz`, resolved with the offset in force at that instant.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// True when the local date at `now` differs from the local date at `now - window`.
///
/// Both sides resolve their own offset, so a DST jump between them cannot
/// produce a second flip or hide the real one.
pub fn detect(now: DateTime<Utc>, window: Duration, tz: Tz) -> bool {
    match now.checked_sub_signed(window) {
        Some(then) => local_date(now, tz) != local_date(then, tz),
        None => false,
    }
}

/// The `(now, lookback)` pair evaluated by a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickWindow {
    now: DateTime<Utc>,
    lookback: Duration,
}

impl TickWindow {
    pub fn new(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self { now, lookback }
    }

    pub fn from_minutes(now: DateTime<Utc>, minutes: u32) -> Self {
        Self::new(now, Duration::minutes(i64::from(minutes)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    pub fn crossed(&self, tz: Tz) -> bool {
        detect(self.now, self.lookback, tz)
    }

    pub fn candidate(&self, entity_id: EntityId, tz: Tz) -> Option<TriggerCandidate> {
        self.crossed(tz).then(|| TriggerCandidate {
            entity_id,
            local_date: local_date(self.now, tz),
        })
    }
}
