//! Core domain model for CRM deal webhook processing.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Processing state of one inbound webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retrying,
    DeadLetter,
    PendingData,
}

impl EventStatus {
    pub const ALL: [EventStatus; 7] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Success,
        EventStatus::Failed,
        EventStatus::Retrying,
        EventStatus::DeadLetter,
        EventStatus::PendingData,
    ];

    /// Statuses surfaced by the admin failure views and re-armed by bulk retry.
    pub const FAILURE_VIEW: [EventStatus; 3] = [
        EventStatus::Failed,
        EventStatus::Retrying,
        EventStatus::DeadLetter,
    ];

    pub const REARMABLE_IN_BULK: [EventStatus; 2] = [EventStatus::Failed, EventStatus::DeadLetter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::DeadLetter => "DEAD_LETTER",
            Self::PendingData => "PENDING_DATA",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Retrying | Self::DeadLetter)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// One row of the event store. Payload is kept verbatim for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub deal_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Whether a processor pass may take the row. `RETRYING` only once due, `PROCESSING` only
    /// after its owner has been quiet since `stale_before`. `SUCCESS` and `DEAD_LETTER` never.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Pending | EventStatus::Failed | EventStatus::PendingData => true,
            EventStatus::Retrying => self.next_retry_at.is_some_and(|at| at <= now),
            EventStatus::Processing => self.updated_at <= stale_before,
            EventStatus::Success | EventStatus::DeadLetter => false,
        }
    }
}

/// Inbound delivery as handed over by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWebhookEvent {
    pub source: String,
    pub event_type: String,
    pub deal_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Where an extracted value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    StructuredField { key: String },
    TitleSegment { segment: String },
    CommentsPattern { snippet: String },
    Keyword { keyword: String },
    Defaulted,
}

/// Extracted value plus how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value(value: T, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
        }
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(
            self.provenance,
            Some(Provenance::TitleSegment { .. }) | Some(Provenance::CommentsPattern { .. })
        )
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

/// Contact projection safe to show before a lead is purchased.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskedInfo {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub wedding_date: Option<NaiveDate>,
    pub services_needed: Vec<String>,
}

/// Contact projection revealed after purchase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub comments: Option<String>,
}

/// Every lead column written by webhook processing. Upserts overwrite all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadFields {
    pub title: String,
    pub wedding_date: Option<NaiveDate>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub location: Option<String>,
    pub budget: Option<f64>,
    pub description: Option<String>,
    pub services_needed: Vec<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub masked_info: MaskedInfo,
    pub full_info: FullInfo,
    pub pipeline_id: Option<i64>,
    pub stage_id: Option<i64>,
    pub deal_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub external_deal_id: String,
    #[serde(flatten)]
    pub fields: LeadFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Time source injected into everything that schedules or expires.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
