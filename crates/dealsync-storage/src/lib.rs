//! Event store, lead store and CRM HTTP access for dealsync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dealsync_core::{EventStatus, FullInfo, Lead, LeadFields, MaskedInfo, NewWebhookEvent, WebhookEvent};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-status counts over a time window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStats {
    pub counts: HashMap<EventStatus, i64>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl EventStats {
    pub fn count(&self, status: EventStatus) -> i64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl EventFilter {
    fn matches(&self, event: &WebhookEvent) -> bool {
        self.status.is_none_or(|s| event.status == s)
            && self.start.is_none_or(|start| event.created_at >= start)
            && self.end.is_none_or(|end| event.created_at <= end)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<WebhookEvent>,
    pub total: i64,
}

/// Durable record of deliveries. Every status change is a conditional single-row write.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, new: NewWebhookEvent, now: DateTime<Utc>) -> StoreResult<WebhookEvent>;

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEvent>>;

    /// Claims `seen` for one processor pass: `-> PROCESSING` only if the row is unchanged since it
    /// was read and still claimable (see [`WebhookEvent::is_claimable`]). False when another
    /// pass moved it first.
    async fn mark_processing(
        &self,
        seen: &WebhookEvent,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// `PROCESSING -> status`, stamping `processed_at`. False when another writer moved the row first.
    async fn finish_event(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Moves the event `PROCESSING -> SUCCESS` and upserts the lead in one transaction.
    /// `None`, with nothing written, when the event left `PROCESSING` mid-pass.
    async fn complete_with_lead(
        &self,
        id: Uuid,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Lead>>;

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEvent>>;

    /// Rows nobody will pick up on their own: re-armed `PENDING`, plus `PENDING`, `PROCESSING`
    /// and `FAILED` rows untouched since `stranded_before` (the pass that owned them died).
    async fn recoverable_events(
        &self,
        now: DateTime<Utc>,
        stranded_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEvent>>;

    /// `FAILED -> RETRYING | DEAD_LETTER`, incrementing `retry_count` only if it still equals
    /// `expected_retry_count` and is below `max_retries`. Returns the updated row, or `None`
    /// when a concurrent writer won.
    async fn record_retry_failure(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>>;

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<EventStats>;

    async fn list_events(&self, filter: &EventFilter, page: i64, limit: i64) -> StoreResult<EventPage>;

    async fn recent_failures(&self, limit: i64) -> StoreResult<Vec<WebhookEvent>>;

    /// Re-arms a non-`SUCCESS` event; `None` if it is missing or already succeeded.
    async fn rearm_event(
        &self,
        id: Uuid,
        reset_retry_count: bool,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>>;

    async fn rearm_all_failed(
        &self,
        reset_retry_count: bool,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_lead(&self, external_deal_id: &str) -> StoreResult<Option<Lead>>;

    async fn upsert_lead(
        &self,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Lead>;

    async fn count_leads(&self) -> StoreResult<i64>;
}

const EVENT_COLUMNS: &str = "id, source, event_type, deal_id, payload, status, retry_count, \
     next_retry_at, error, processed_at, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, external_deal_id, title, wedding_date, city, state, location, \
     budget, description, services_needed, contact_name, contact_email, contact_phone, \
     masked_info, full_info, pipeline_id, stage_id, deal_created_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(start) = filter.start {
            qb.push(" AND created_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end {
            qb.push(" AND created_at <= ").push_bind(end);
        }
    }
}

fn event_from_row(row: &PgRow) -> StoreResult<WebhookEvent> {
    let status: String = row.try_get("status")?;
    Ok(WebhookEvent {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        event_type: row.try_get("event_type")?,
        deal_id: row.try_get("deal_id")?,
        payload: row.try_get("payload")?,
        status: status
            .parse()
            .map_err(|err: dealsync_core::UnknownStatus| StoreError::Corrupt(err.to_string()))?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        error: row.try_get("error")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn lead_from_row(row: &PgRow) -> StoreResult<Lead> {
    let masked_info: Json<MaskedInfo> = row.try_get("masked_info")?;
    let full_info: Json<FullInfo> = row.try_get("full_info")?;
    let wedding_date: Option<NaiveDate> = row.try_get("wedding_date")?;
    Ok(Lead {
        id: row.try_get("id")?,
        external_deal_id: row.try_get("external_deal_id")?,
        fields: LeadFields {
            title: row.try_get("title")?,
            wedding_date,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            location: row.try_get("location")?,
            budget: row.try_get("budget")?,
            description: row.try_get("description")?,
            services_needed: row.try_get("services_needed")?,
            contact_name: row.try_get("contact_name")?,
            contact_email: row.try_get("contact_email")?,
            contact_phone: row.try_get("contact_phone")?,
            masked_info: masked_info.0,
            full_info: full_info.0,
            pipeline_id: row.try_get("pipeline_id")?,
            stage_id: row.try_get("stage_id")?,
            deal_created_at: row.try_get("deal_created_at")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn upsert_lead_with<'e, E>(
    executor: E,
    external_deal_id: &str,
    fields: &LeadFields,
    now: DateTime<Utc>,
) -> StoreResult<Lead>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        r#"
        INSERT INTO leads (
            id, external_deal_id, title, wedding_date, city, state, location, budget,
            description, services_needed, contact_name, contact_email, contact_phone,
            masked_info, full_info, pipeline_id, stage_id, deal_created_at, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $19
        )
        ON CONFLICT (external_deal_id) DO UPDATE SET
            title = EXCLUDED.title,
            wedding_date = EXCLUDED.wedding_date,
            city = EXCLUDED.city,
            state = EXCLUDED.state,
            location = EXCLUDED.location,
            budget = EXCLUDED.budget,
            description = EXCLUDED.description,
            services_needed = EXCLUDED.services_needed,
            contact_name = EXCLUDED.contact_name,
            contact_email = EXCLUDED.contact_email,
            contact_phone = EXCLUDED.contact_phone,
            masked_info = EXCLUDED.masked_info,
            full_info = EXCLUDED.full_info,
            pipeline_id = EXCLUDED.pipeline_id,
            stage_id = EXCLUDED.stage_id,
            deal_created_at = EXCLUDED.deal_created_at,
            updated_at = EXCLUDED.updated_at
        RETURNING {LEAD_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(Uuid::new_v4())
        .bind(external_deal_id)
        .bind(&fields.title)
        .bind(fields.wedding_date)
        .bind(&fields.city)
        .bind(&fields.state)
        .bind(&fields.location)
        .bind(fields.budget)
        .bind(&fields.description)
        .bind(&fields.services_needed[..])
        .bind(&fields.contact_name)
        .bind(&fields.contact_email)
        .bind(&fields.contact_phone)
        .bind(Json(&fields.masked_info))
        .bind(Json(&fields.full_info))
        .bind(fields.pipeline_id)
        .bind(fields.stage_id)
        .bind(fields.deal_created_at)
        .bind(now)
        .fetch_one(executor)
        .await?;
    lead_from_row(&row)
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, new: NewWebhookEvent, now: DateTime<Utc>) -> StoreResult<WebhookEvent> {
        let sql = format!(
            r#"
            INSERT INTO webhook_events (
                id, source, event_type, deal_id, payload, status, retry_count, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $6)
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.source)
            .bind(&new.event_type)
            .bind(&new.deal_id)
            .bind(&new.payload)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        event_from_row(&row)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn mark_processing(
        &self,
        seen: &WebhookEvent,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = 'PROCESSING',
                   updated_at = $5
             WHERE id = $1
               AND status = $2
               AND retry_count = $3
               AND updated_at = $4
               AND (status IN ('PENDING', 'FAILED', 'PENDING_DATA')
                    OR (status = 'RETRYING' AND next_retry_at <= $5)
                    OR (status = 'PROCESSING' AND updated_at <= $6))
            "#,
        )
        .bind(seen.id)
        .bind(seen.status.as_str())
        .bind(seen.retry_count)
        .bind(seen.updated_at)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_event(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = $2,
                   error = $3,
                   processed_at = $4,
                   next_retry_at = NULL,
                   updated_at = $4
             WHERE id = $1
               AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_with_lead(
        &self,
        id: Uuid,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Lead>> {
        let mut tx = self.pool.begin().await?;
        let completed = sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = 'SUCCESS',
                   error = NULL,
                   processed_at = $2,
                   next_retry_at = NULL,
                   updated_at = $2
             WHERE id = $1
               AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if completed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }
        let lead = upsert_lead_with(&mut *tx, external_deal_id, fields, now).await?;
        tx.commit().await?;
        Ok(Some(lead))
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEvent>> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM webhook_events
             WHERE status = 'RETRYING'
               AND next_retry_at <= $1
               AND retry_count < $2
             ORDER BY next_retry_at ASC
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(max_retries)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn recoverable_events(
        &self,
        now: DateTime<Utc>,
        stranded_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEvent>> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM webhook_events
             WHERE (status = 'PENDING'
                    AND (next_retry_at <= $1
                         OR (next_retry_at IS NULL AND updated_at <= $2)))
                OR (status IN ('PROCESSING', 'FAILED') AND updated_at <= $2)
             ORDER BY CASE WHEN status = 'PENDING' THEN COALESCE(next_retry_at, updated_at)
                           ELSE updated_at END ASC
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(stranded_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn record_retry_failure(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>> {
        let sql = format!(
            r#"
            UPDATE webhook_events
               SET retry_count = retry_count + 1,
                   status = CASE WHEN retry_count + 1 >= $3 THEN 'DEAD_LETTER' ELSE 'RETRYING' END,
                   next_retry_at = CASE WHEN retry_count + 1 >= $3 THEN NULL ELSE $4 END,
                   updated_at = $5
             WHERE id = $1
               AND status = 'FAILED'
               AND retry_count = $2
               AND retry_count < $3
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected_retry_count)
            .bind(max_retries)
            .bind(next_retry_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<EventStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n, MAX(created_at) AS last_event_at
              FROM webhook_events
             WHERE created_at >= $1
             GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = EventStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let status: EventStatus = status
                .parse()
                .map_err(|err: dealsync_core::UnknownStatus| StoreError::Corrupt(err.to_string()))?;
            let n: i64 = row.try_get("n")?;
            let last: Option<DateTime<Utc>> = row.try_get("last_event_at")?;
            stats.counts.insert(status, n);
            stats.last_event_at = stats.last_event_at.max(last);
        }
        Ok(stats)
    }

    async fn list_events(&self, filter: &EventFilter, page: i64, limit: i64) -> StoreResult<EventPage> {
        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM webhook_events WHERE 1 = 1");
        Self::push_filters(&mut count_qb, filter);
        let total = count_qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE 1 = 1"));
        Self::push_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind((page - 1).max(0) * limit);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let events = rows.iter().map(event_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(EventPage { events, total })
    }

    async fn recent_failures(&self, limit: i64) -> StoreResult<Vec<WebhookEvent>> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM webhook_events
             WHERE status IN ('FAILED', 'RETRYING', 'DEAD_LETTER')
             ORDER BY updated_at DESC
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn rearm_event(
        &self,
        id: Uuid,
        reset_retry_count: bool,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>> {
        let sql = format!(
            r#"
            UPDATE webhook_events
               SET status = CASE WHEN $2 THEN 'PENDING' ELSE 'RETRYING' END,
                   retry_count = CASE WHEN $2 THEN 0 ELSE LEAST(retry_count, $3 - 1) END,
                   error = NULL,
                   next_retry_at = $4,
                   updated_at = $4
             WHERE id = $1
               AND status <> 'SUCCESS'
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(reset_retry_count)
            .bind(max_retries)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn rearm_all_failed(
        &self,
        reset_retry_count: bool,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = CASE WHEN $1 THEN 'PENDING' ELSE 'RETRYING' END,
                   retry_count = CASE WHEN $1 THEN 0 ELSE LEAST(retry_count, $2 - 1) END,
                   error = NULL,
                   next_retry_at = $3,
                   updated_at = $3
             WHERE status IN ('FAILED', 'DEAD_LETTER')
            "#,
        )
        .bind(reset_retry_count)
        .bind(max_retries)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn find_lead(&self, external_deal_id: &str) -> StoreResult<Option<Lead>> {
        let sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE external_deal_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_deal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn upsert_lead(
        &self,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Lead> {
        upsert_lead_with(&self.pool, external_deal_id, fields, now).await
    }

    async fn count_leads(&self) -> StoreResult<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    events: HashMap<Uuid, WebhookEvent>,
    leads: HashMap<String, Lead>,
}

/// In-process store with the same predicates as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_lead_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` lead writes fail as if the database dropped the connection.
    pub fn fail_next_lead_writes(&self, n: usize) {
        self.failing_lead_writes.store(n, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<WebhookEvent> {
        let state = self.state.lock().await;
        let mut events = state.events.values().cloned().collect::<Vec<_>>();
        events.sort_by_key(|e| e.created_at);
        events
    }

    pub async fn put_event(&self, event: WebhookEvent) {
        self.state.lock().await.events.insert(event.id, event);
    }

    fn take_injected_failure(&self) -> StoreResult<()> {
        let injected = self
            .failing_lead_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected lead write failure".into()));
        }
        Ok(())
    }

    fn upsert_in(
        state: &mut MemoryState,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> Lead {
        let lead = state
            .leads
            .entry(external_deal_id.to_string())
            .or_insert_with(|| Lead {
                id: Uuid::new_v4(),
                external_deal_id: external_deal_id.to_string(),
                fields: fields.clone(),
                created_at: now,
                updated_at: now,
            });
        lead.fields = fields.clone();
        lead.updated_at = now;
        lead.clone()
    }

    fn rearm(event: &mut WebhookEvent, reset: bool, max_retries: i32, now: DateTime<Utc>) {
        if reset {
            event.status = EventStatus::Pending;
            event.retry_count = 0;
        } else {
            event.status = EventStatus::Retrying;
            event.retry_count = event.retry_count.min(max_retries - 1).max(0);
        }
        event.error = None;
        event.next_retry_at = Some(now);
        event.updated_at = now;
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, new: NewWebhookEvent, now: DateTime<Utc>) -> StoreResult<WebhookEvent> {
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            source: new.source,
            event_type: new.event_type,
            deal_id: new.deal_id,
            payload: new.payload,
            status: EventStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            error: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEvent>> {
        Ok(self.state.lock().await.events.get(&id).cloned())
    }

    async fn mark_processing(
        &self,
        seen: &WebhookEvent,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(&seen.id) {
            Some(event)
                if event.status == seen.status
                    && event.retry_count == seen.retry_count
                    && event.updated_at == seen.updated_at
                    && event.is_claimable(now, stale_before) =>
            {
                event.status = EventStatus::Processing;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_event(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(&id) {
            Some(event) if event.status == EventStatus::Processing => {
                event.status = status;
                event.error = error.map(str::to_string);
                event.processed_at = Some(now);
                event.next_retry_at = None;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_with_lead(
        &self,
        id: Uuid,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Lead>> {
        self.take_injected_failure()?;
        let mut state = self.state.lock().await;
        match state.events.get_mut(&id) {
            Some(event) if event.status == EventStatus::Processing => {
                event.status = EventStatus::Success;
                event.error = None;
                event.processed_at = Some(now);
                event.next_retry_at = None;
                event.updated_at = now;
            }
            _ => return Ok(None),
        }
        Ok(Some(Self::upsert_in(&mut state, external_deal_id, fields, now)))
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEvent>> {
        let state = self.state.lock().await;
        let mut due = state
            .events
            .values()
            .filter(|e| {
                e.status == EventStatus::Retrying
                    && e.next_retry_at.is_some_and(|at| at <= now)
                    && e.retry_count < max_retries
            })
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|e| e.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn recoverable_events(
        &self,
        now: DateTime<Utc>,
        stranded_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEvent>> {
        let state = self.state.lock().await;
        let mut stranded = state
            .events
            .values()
            .filter(|e| match e.status {
                EventStatus::Pending => match e.next_retry_at {
                    Some(at) => at <= now,
                    None => e.updated_at <= stranded_before,
                },
                EventStatus::Processing | EventStatus::Failed => e.updated_at <= stranded_before,
                _ => false,
            })
            .cloned()
            .collect::<Vec<_>>();
        stranded.sort_by_key(|e| match e.status {
            EventStatus::Pending => e.next_retry_at.unwrap_or(e.updated_at),
            _ => e.updated_at,
        });
        stranded.truncate(limit.max(0) as usize);
        Ok(stranded)
    }

    async fn record_retry_failure(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>> {
        let mut state = self.state.lock().await;
        let Some(event) = state.events.get_mut(&id) else {
            return Ok(None);
        };
        if event.status != EventStatus::Failed
            || event.retry_count != expected_retry_count
            || event.retry_count >= max_retries
        {
            return Ok(None);
        }
        event.retry_count += 1;
        if event.retry_count >= max_retries {
            event.status = EventStatus::DeadLetter;
            event.next_retry_at = None;
        } else {
            event.status = EventStatus::Retrying;
            event.next_retry_at = Some(next_retry_at);
        }
        event.updated_at = now;
        Ok(Some(event.clone()))
    }

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<EventStats> {
        let state = self.state.lock().await;
        let mut stats = EventStats::default();
        for event in state.events.values().filter(|e| e.created_at >= since) {
            *stats.counts.entry(event.status).or_default() += 1;
            stats.last_event_at = stats.last_event_at.max(Some(event.created_at));
        }
        Ok(stats)
    }

    async fn list_events(&self, filter: &EventFilter, page: i64, limit: i64) -> StoreResult<EventPage> {
        let state = self.state.lock().await;
        let mut matching = state
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        let offset = ((page - 1).max(0) * limit).max(0) as usize;
        let events = matching
            .into_iter()
            .skip(offset)
            .take(limit.max(0) as usize)
            .collect();
        Ok(EventPage { events, total })
    }

    async fn recent_failures(&self, limit: i64) -> StoreResult<Vec<WebhookEvent>> {
        let state = self.state.lock().await;
        let mut failures = state
            .events
            .values()
            .filter(|e| EventStatus::FAILURE_VIEW.contains(&e.status))
            .cloned()
            .collect::<Vec<_>>();
        failures.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failures.truncate(limit.max(0) as usize);
        Ok(failures)
    }

    async fn rearm_event(
        &self,
        id: Uuid,
        reset_retry_count: bool,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(&id) {
            Some(event) if event.status != EventStatus::Success => {
                Self::rearm(event, reset_retry_count, max_retries, now);
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn rearm_all_failed(
        &self,
        reset_retry_count: bool,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut n = 0;
        for event in state
            .events
            .values_mut()
            .filter(|e| EventStatus::REARMABLE_IN_BULK.contains(&e.status))
        {
            Self::rearm(event, reset_retry_count, max_retries, now);
            n += 1;
        }
        Ok(n)
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn find_lead(&self, external_deal_id: &str) -> StoreResult<Option<Lead>> {
        Ok(self.state.lock().await.leads.get(external_deal_id).cloned())
    }

    async fn upsert_lead(
        &self,
        external_deal_id: &str,
        fields: &LeadFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Lead> {
        self.take_injected_failure()?;
        let mut state = self.state.lock().await;
        Ok(Self::upsert_in(&mut state, external_deal_id, fields, now))
    }

    async fn count_leads(&self) -> StoreResult<i64> {
        Ok(self.state.lock().await.leads.len() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Request-level backoff inside one CRM call; independent from the event retry schedule.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for CrmClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.pipedrive.com/v1".to_string(),
            api_token: String::new(),
            timeout: Duration::from_secs(10),
            user_agent: Some("dealsync/0.1".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("crm http status {status} for {path}")]
    HttpStatus { status: u16, path: String },
    #[error("crm response for {path} reported success=false")]
    Unsuccessful { path: String },
    #[error("decoding crm response for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CrmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

#[derive(Debug, Deserialize)]
struct CrmEnvelope {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    additional_data: Option<AdditionalData>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AdditionalData {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    more_items_in_collection: bool,
    next_start: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrmPage<T> {
    pub items: Vec<T>,
    pub next_start: Option<u64>,
}

/// Thin client over the CRM REST API. Every call is bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    backoff: BackoffPolicy,
}

impl CrmClient {
    pub fn new(config: CrmClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
        })
    }

    async fn get_envelope(&self, path: &str, query: &[(&str, String)]) -> Result<CrmEnvelope, CrmError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.send_with_backoff(&url, path, query)
            .instrument(info_span!("crm_get", path))
            .await
    }

    async fn send_with_backoff(
        &self,
        url: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<CrmEnvelope, CrmError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .get(url)
                .query(&[("api_token", self.api_token.as_str())])
                .query(query)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await?;
                    let envelope: CrmEnvelope =
                        serde_json::from_slice(&bytes).map_err(|source| CrmError::Decode {
                            path: path.to_string(),
                            source,
                        })?;
                    if !envelope.success {
                        return Err(CrmError::Unsuccessful { path: path.to_string() });
                    }
                    return Ok(envelope);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying crm request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(CrmError::HttpStatus {
                        status: status.as_u16(),
                        path: path.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying crm request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(CrmError::Request(err));
                }
            }
        }
    }

    /// Fetches `path` and decodes the envelope's `data` member.
    pub async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, CrmError> {
        let envelope = self.get_envelope(path, &[]).await?;
        serde_json::from_value(envelope.data).map_err(|source| CrmError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// Fetches one page of a collection endpoint.
    pub async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        start: u64,
        limit: u64,
    ) -> Result<CrmPage<T>, CrmError> {
        let envelope = self
            .get_envelope(path, &[("start", start.to_string()), ("limit", limit.to_string())])
            .await?;
        let items: Vec<T> = if envelope.data.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(envelope.data).map_err(|source| CrmError::Decode {
                path: path.to_string(),
                source,
            })?
        };
        let next_start = envelope
            .additional_data
            .and_then(|a| a.pagination)
            .filter(|p| p.more_items_in_collection)
            .and_then(|p| p.next_start);
        Ok(CrmPage { items, next_start })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn delivery(deal_id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            source: "pipedrive".into(),
            event_type: "added.deal".into(),
            deal_id: Some(deal_id.into()),
            payload: json!({"current": {"id": 1, "title": "x"}}),
        }
    }

    fn fields(title: &str) -> LeadFields {
        LeadFields {
            title: title.into(),
            wedding_date: None,
            city: Some("Austin".into()),
            state: Some("TX".into()),
            location: Some("Austin, TX".into()),
            budget: None,
            description: None,
            services_needed: vec!["PHOTOGRAPHY".into()],
            contact_name: None,
            contact_email: None,
            contact_phone: None,
            masked_info: MaskedInfo::default(),
            full_info: FullInfo::default(),
            pipeline_id: None,
            stage_id: None,
            deal_created_at: None,
        }
    }

    /// Serves `GET /deals/1`: the first `failures` hits answer `status`, then `body` with 200.
    async fn crm_stub(
        failures: usize,
        status: axum::http::StatusCode,
        body: serde_json::Value,
    ) -> (CrmClient, Arc<AtomicUsize>) {
        use axum::extract::State;
        use axum::http::StatusCode as AxumStatus;
        use axum::routing::get;

        let hits = Arc::new(AtomicUsize::new(0));
        let app = axum::Router::new()
            .route(
                "/deals/1",
                get(
                    move |State(hits): State<Arc<AtomicUsize>>| {
                        let body = body.clone();
                        async move {
                            if hits.fetch_add(1, Ordering::SeqCst) < failures {
                                (status, axum::Json(json!({"success": false})))
                            } else {
                                (AxumStatus::OK, axum::Json(body))
                            }
                        }
                    },
                ),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = CrmClient::new(CrmClientConfig {
            base_url: format!("http://{addr}"),
            api_token: "token".into(),
            timeout: Duration::from_secs(2),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .unwrap();
        (client, hits)
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct StubDeal {
        id: i64,
        title: String,
    }

    #[tokio::test]
    async fn crm_client_retries_throttling_until_the_call_succeeds() {
        let (client, hits) = crm_stub(
            2,
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            json!({"success": true, "data": {"id": 1, "title": "Smith wedding"}}),
        )
        .await;

        let deal: StubDeal = client.get_data("deals/1").await.unwrap();
        assert_eq!(deal, StubDeal { id: 1, title: "Smith wedding".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn crm_client_gives_up_after_the_backoff_budget() {
        let (client, hits) = crm_stub(
            10,
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            json!({"success": true, "data": {}}),
        )
        .await;

        let err = client.get_data::<StubDeal>("deals/1").await.unwrap_err();
        assert!(matches!(err, CrmError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn crm_client_does_not_retry_client_errors_or_unsuccessful_envelopes() {
        let (client, hits) = crm_stub(1, axum::http::StatusCode::NOT_FOUND, json!({})).await;
        let err = client.get_data::<StubDeal>("deals/1").await.unwrap_err();
        assert!(matches!(err, CrmError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (client, hits) = crm_stub(
            0,
            axum::http::StatusCode::OK,
            json!({"success": false, "error": "Deal not found"}),
        )
        .await;
        let err = client.get_data::<StubDeal>("deals/1").await.unwrap_err();
        assert!(matches!(err, CrmError::Unsuccessful { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn receipt_creates_exactly_one_pending_row() {
        let store = MemoryStore::new();
        let event = store.insert_event(delivery("500"), t0()).await.unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn success_rows_cannot_be_moved_back_to_processing() {
        let store = MemoryStore::new();
        let event = store.insert_event(delivery("500"), t0()).await.unwrap();
        assert!(store.mark_processing(&event, t0(), t0()).await.unwrap());
        store
            .complete_with_lead(event.id, "500", &fields("a"), t0())
            .await
            .unwrap()
            .unwrap();
        let done = store.get_event(event.id).await.unwrap().unwrap();
        assert!(!store
            .mark_processing(&done, t0() + chrono::Duration::days(1), t0())
            .await
            .unwrap());
        assert!(!store
            .finish_event(event.id, EventStatus::Failed, Some("late"), t0())
            .await
            .unwrap());
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Success);
    }

    #[tokio::test]
    async fn retry_failure_is_counted_once_per_expected_count() {
        let store = MemoryStore::new();
        let event = store.insert_event(delivery("9"), t0()).await.unwrap();
        store.mark_processing(&event, t0(), t0()).await.unwrap();
        store
            .finish_event(event.id, EventStatus::Failed, Some("boom"), t0())
            .await
            .unwrap();

        let next = t0() + chrono::Duration::minutes(1);
        let first = store.record_retry_failure(event.id, 0, 5, next, t0()).await.unwrap();
        let second = store.record_retry_failure(event.id, 0, 5, next, t0()).await.unwrap();

        let first = first.expect("first writer wins");
        assert_eq!(first.status, EventStatus::Retrying);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.next_retry_at, Some(next));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn reaching_max_retries_dead_letters() {
        let store = MemoryStore::new();
        let event = store.insert_event(delivery("9"), t0()).await.unwrap();
        store.mark_processing(&event, t0(), t0()).await.unwrap();
        store
            .finish_event(event.id, EventStatus::Failed, Some("boom"), t0())
            .await
            .unwrap();
        let mut row = store.get_event(event.id).await.unwrap().unwrap();
        row.retry_count = 4;
        store.put_event(row).await;

        let updated = store
            .record_retry_failure(event.id, 4, 5, t0(), t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, EventStatus::DeadLetter);
        assert_eq!(updated.retry_count, 5);
        assert_eq!(updated.next_retry_at, None);
        assert!(store.due_retries(t0(), 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_failure_never_counts_past_max_retries() {
        let store = MemoryStore::new();
        let mut event = store.insert_event(delivery("9"), t0()).await.unwrap();
        event.status = EventStatus::Failed;
        event.retry_count = 5;
        store.put_event(event.clone()).await;

        let updated = store.record_retry_failure(event.id, 5, 5, t0(), t0()).await.unwrap();
        assert!(updated.is_none());
        assert_eq!(store.get_event(event.id).await.unwrap().unwrap().retry_count, 5);
    }

    #[tokio::test]
    async fn claim_fails_once_the_row_moved_after_it_was_read() {
        let store = MemoryStore::new();
        let mut event = store.insert_event(delivery("9"), t0()).await.unwrap();
        event.status = EventStatus::Retrying;
        event.retry_count = 4;
        event.next_retry_at = Some(t0());
        store.put_event(event.clone()).await;
        let stale_read = event.clone();

        assert!(store.mark_processing(&event, t0(), t0()).await.unwrap());
        store
            .finish_event(event.id, EventStatus::Failed, Some("boom"), t0())
            .await
            .unwrap();
        store.record_retry_failure(event.id, 4, 5, t0(), t0()).await.unwrap();

        assert!(!store.mark_processing(&stale_read, t0(), t0()).await.unwrap());
        let dead = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(dead.status, EventStatus::DeadLetter);
        assert!(!store.mark_processing(&dead, t0(), t0()).await.unwrap());
        assert_eq!(store.get_event(event.id).await.unwrap().unwrap().retry_count, 5);
    }

    #[tokio::test]
    async fn retrying_rows_are_not_claimable_before_they_are_due() {
        let store = MemoryStore::new();
        let mut event = store.insert_event(delivery("9"), t0()).await.unwrap();
        event.status = EventStatus::Retrying;
        event.retry_count = 2;
        event.next_retry_at = Some(t0() + chrono::Duration::minutes(5));
        store.put_event(event.clone()).await;

        assert!(!store.mark_processing(&event, t0(), t0()).await.unwrap());
        let later = t0() + chrono::Duration::minutes(5);
        assert!(store.mark_processing(&event, later, later).await.unwrap());
    }

    #[tokio::test]
    async fn completion_after_a_rearm_writes_nothing() {
        let store = MemoryStore::new();
        let event = store.insert_event(delivery("9"), t0()).await.unwrap();
        assert!(store.mark_processing(&event, t0(), t0()).await.unwrap());
        store.rearm_event(event.id, true, 5, t0()).await.unwrap().unwrap();

        let lead = store
            .complete_with_lead(event.id, "9", &fields("late"), t0())
            .await
            .unwrap();
        assert!(lead.is_none());
        assert_eq!(store.count_leads().await.unwrap(), 0);
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn abandoned_processing_and_failed_rows_become_recoverable() {
        let store = MemoryStore::new();
        let processing = store.insert_event(delivery("1"), t0()).await.unwrap();
        store.mark_processing(&processing, t0(), t0()).await.unwrap();
        let failed = store.insert_event(delivery("2"), t0()).await.unwrap();
        store.mark_processing(&failed, t0(), t0()).await.unwrap();
        store
            .finish_event(failed.id, EventStatus::Failed, Some("boom"), t0())
            .await
            .unwrap();
        let parked = store.insert_event(delivery("3"), t0()).await.unwrap();
        store.mark_processing(&parked, t0(), t0()).await.unwrap();
        store
            .finish_event(parked.id, EventStatus::PendingData, Some("no location"), t0())
            .await
            .unwrap();

        let too_early = store
            .recoverable_events(t0(), t0() - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert!(too_early.is_empty());

        let later = t0() + chrono::Duration::hours(1);
        let stranded = store
            .recoverable_events(later, later - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        let ids = stranded.iter().map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&processing.id));
        assert!(ids.contains(&failed.id));
    }

    #[tokio::test]
    async fn rearm_without_reset_keeps_retrying_invariant() {
        let store = MemoryStore::new();
        let mut event = store.insert_event(delivery("9"), t0()).await.unwrap();
        event.status = EventStatus::DeadLetter;
        event.retry_count = 5;
        store.put_event(event.clone()).await;

        let rearmed = store.rearm_event(event.id, false, 5, t0()).await.unwrap().unwrap();
        assert_eq!(rearmed.status, EventStatus::Retrying);
        assert_eq!(rearmed.retry_count, 4);
        assert_eq!(rearmed.next_retry_at, Some(t0()));
        assert_eq!(store.due_retries(t0(), 5, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_events_filters_and_paginates_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert_event(delivery(&i.to_string()), t0() + chrono::Duration::minutes(i))
                .await
                .unwrap();
        }
        let page = store
            .list_events(&EventFilter::default(), 2, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].deal_id.as_deref(), Some("2"));

        let filtered = store
            .list_events(
                &EventFilter {
                    status: Some(EventStatus::Failed),
                    ..Default::default()
                },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(filtered.total, 0);
    }

    #[tokio::test]
    async fn upsert_overwrites_lead_in_place() {
        let store = MemoryStore::new();
        let first = store.upsert_lead("501", &fields("first"), t0()).await.unwrap();
        let second = store
            .upsert_lead("501", &fields("second"), t0() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.fields.title, "second");
        assert_eq!(second.created_at, t0());
        assert_eq!(store.count_leads().await.unwrap(), 1);
    }
}
