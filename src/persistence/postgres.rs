//! PostgreSQL implementation of the persistence layer.
//!
//! Every invariant the in-memory backend enforces in Rust is enforced here
//! in SQL: conditional `UPDATE`s for session CAS and single-shot
//! timestamps, `ON CONFLICT DO NOTHING` for idempotent inserts, and
//! `FOR UPDATE SKIP LOCKED` for job claims.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::models::{
    AgreementRow, AlertRow, CatchRow, ComingRow, SessionRow, SubscriptionRow, convert_all,
};
use super::{
    AgreementStore, AlertStore, CatchStore, JobPostStore, ProcessedStore, SessionStore,
    StoreError, SubscriptionStore,
};
use crate::dispatch::{FailOutcome, Job, JobQueue, MAX_ATTEMPTS, QueueError, QueuedJob};
use crate::domain::geo::BoundingBox;
use crate::domain::{
    Agreement, AgreementId, AgreementStatus, AlertId, CatchId, CatchStatus, ComingResponse,
    DeliveryFrequency, DeliveryReceipt, FishAlert, FishCatch, FishSubscription, FishTypeId,
    JobPost, ReceiptStatus, Session, SubscriptionId,
};

macro_rules! session_cols {
    () => {
        "phone, current_flow, current_step, temp_data, last_activity_at, version"
    };
}

macro_rules! subscription_cols {
    () => {
        "id, phone, lat, lon, radius_km, all_fish_types, fish_type_ids, frequency, paused, active, created_at"
    };
}

macro_rules! catch_cols {
    () => {
        "id, seller_phone, fish_type, lat, lon, price_per_kg, quantity_kg, status, photo, \
         customers_coming, created_at, expires_at"
    };
}

macro_rules! alert_cols {
    () => {
        "a.id, a.subscription_id, a.catch_id, a.phone, a.provider_message_id, a.created_at, \
         a.sent_at, a.delivered_at, a.clicked_at, a.failed_at, a.failure_reason"
    };
}

macro_rules! agreement_cols {
    () => {
        "id, creator_phone, counterparty_phone, direction, amount, purpose, due_date, status, \
         reminded_at, created_at"
    };
}

// Bounding boxes may straddle the antimeridian, so longitudes are also
// compared shifted by a full turn. Binds: $1..$4 = min_lat, max_lat,
// min_lon, max_lon.
macro_rules! in_box {
    () => {
        "lat BETWEEN $1 AND $2 AND (lon BETWEEN $3 AND $4 \
         OR lon + 360 BETWEEN $3 AND $4 OR lon - 360 BETWEEN $3 AND $4)"
    };
}

/// How long a claimed job stays invisible to other workers.
const JOB_LEASE_SECS: f64 = 300.0;

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn queue_backend(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// Opens a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if the database is unreachable.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections.min(max_connections))
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .map_err(backend)
}

/// Applies the bundled migrations.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))
}

/// PostgreSQL-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a store over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn load_or_create(&self, phone: &str) -> Result<Session, StoreError> {
        sqlx::query("INSERT INTO conversation_sessions (phone) VALUES ($1) ON CONFLICT (phone) DO NOTHING")
            .bind(phone)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        let row = sqlx::query_as::<_, SessionRow>(concat!(
            "SELECT ",
            session_cols!(),
            " FROM conversation_sessions WHERE phone = $1"
        ))
        .bind(phone)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.into())
    }

    async fn save(&self, session: &Session) -> Result<Session, StoreError> {
        let temp_data = (!session.temp_data.is_null()).then(|| session.temp_data.clone());
        let row = sqlx::query_as::<_, SessionRow>(concat!(
            "INSERT INTO conversation_sessions AS s \
             (phone, current_flow, current_step, temp_data, last_activity_at, version) \
             VALUES ($1, $2, $3, $4, now(), 1) \
             ON CONFLICT (phone) DO UPDATE SET \
             current_flow = EXCLUDED.current_flow, current_step = EXCLUDED.current_step, \
             temp_data = EXCLUDED.temp_data, last_activity_at = now(), version = s.version + 1 \
             WHERE s.version = $5 \
             RETURNING ",
            session_cols!()
        ))
        .bind(&session.phone)
        .bind(session.flow.as_str())
        .bind(session.step())
        .bind(temp_data)
        .bind(session.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Session::from).ok_or_else(|| StoreError::Conflict {
            phone: session.phone.clone(),
            expected: session.version,
        })
    }
}

#[async_trait]
impl ProcessedStore for PgStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM processed_webhooks WHERE message_id = $1)",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO processed_webhooks (message_id, processed_at) VALUES ($1, $2) \
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert_subscription(&self, sub: &FishSubscription) -> Result<(), StoreError> {
        let ids: Vec<i32> = sub.fish_types.ids().into_iter().map(|t| t.0).collect();
        sqlx::query(
            "INSERT INTO fish_subscriptions \
             (id, phone, lat, lon, radius_km, all_fish_types, fish_type_ids, frequency, paused, active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(*sub.id.as_uuid())
        .bind(&sub.phone)
        .bind(sub.location.lat)
        .bind(sub.location.lon)
        .bind(sub.radius.km())
        .bind(ids.is_empty())
        .bind(ids)
        .bind(sub.frequency.as_str())
        .bind(sub.paused)
        .bind(sub.active)
        .bind(sub.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn active_subscription_for(
        &self,
        phone: &str,
    ) -> Result<Option<FishSubscription>, StoreError> {
        sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_cols!(),
            " FROM fish_subscriptions WHERE phone = $1 AND active ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(FishSubscription::try_from)
        .transpose()
    }

    async fn set_subscription_state(
        &self,
        id: SubscriptionId,
        paused: bool,
        active: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE fish_subscriptions SET paused = $2, active = $3 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(paused)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("subscription {id}")));
        }
        Ok(())
    }

    async fn listening_subscriptions_in(
        &self,
        area: &BoundingBox,
    ) -> Result<Vec<FishSubscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_cols!(),
            " FROM fish_subscriptions WHERE active AND NOT paused AND ",
            in_box!()
        ))
        .bind(area.min_lat)
        .bind(area.max_lat)
        .bind(area.min_lon)
        .bind(area.max_lon)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        convert_all(rows)
    }
}

#[async_trait]
impl CatchStore for PgStore {
    async fn insert_catch(&self, catch: &FishCatch) -> Result<(), StoreError> {
        let photo = catch
            .photo
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO fish_catches \
             (id, seller_phone, fish_type, lat, lon, price_per_kg, quantity_kg, status, photo, \
              customers_coming, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(*catch.id.as_uuid())
        .bind(&catch.seller_phone)
        .bind(catch.fish_type.0)
        .bind(catch.location.map(|p| p.lat))
        .bind(catch.location.map(|p| p.lon))
        .bind(catch.price_per_kg)
        .bind(catch.quantity_kg)
        .bind(catch.status.as_str())
        .bind(photo)
        .bind(catch.customers_coming)
        .bind(catch.created_at)
        .bind(catch.expires_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn catch_by_id(&self, id: CatchId) -> Result<Option<FishCatch>, StoreError> {
        sqlx::query_as::<_, CatchRow>(concat!("SELECT ", catch_cols!(), " FROM fish_catches WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(FishCatch::try_from)
            .transpose()
    }

    async fn open_catches_by_seller(
        &self,
        seller: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<FishCatch>, StoreError> {
        let rows = sqlx::query_as::<_, CatchRow>(concat!(
            "SELECT ",
            catch_cols!(),
            " FROM fish_catches WHERE seller_phone = $1 AND status IN ('available', 'low_stock') \
             AND expires_at > $2 ORDER BY created_at DESC"
        ))
        .bind(seller)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        convert_all(rows)
    }

    async fn count_catches_since(
        &self,
        seller: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM fish_catches WHERE seller_phone = $1 AND created_at >= $2",
        )
        .bind(seller)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn set_catch_status(
        &self,
        id: CatchId,
        status: CatchStatus,
    ) -> Result<CatchStatus, StoreError> {
        let previous = sqlx::query_scalar::<_, String>(
            "UPDATE fish_catches c SET status = $2 \
             FROM (SELECT id, status FROM fish_catches WHERE id = $1 FOR UPDATE) old \
             WHERE c.id = old.id RETURNING old.status",
        )
        .bind(*id.as_uuid())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("catch {id}")))?;
        CatchStatus::parse(&previous)
            .ok_or_else(|| StoreError::Corrupt(format!("catch {id}: status {previous}")))
    }

    async fn open_catches_in(
        &self,
        area: &BoundingBox,
        fish_type: Option<FishTypeId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FishCatch>, StoreError> {
        let rows = sqlx::query_as::<_, CatchRow>(concat!(
            "SELECT ",
            catch_cols!(),
            " FROM fish_catches WHERE status IN ('available', 'low_stock') AND expires_at > $5 \
             AND ($6::INTEGER IS NULL OR fish_type = $6) AND ",
            in_box!()
        ))
        .bind(area.min_lat)
        .bind(area.max_lat)
        .bind(area.min_lon)
        .bind(area.max_lon)
        .bind(now)
        .bind(fish_type.map(|t| t.0))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        convert_all(rows)
    }

    async fn expire_catches(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE fish_catches SET status = 'expired' \
             WHERE status IN ('available', 'low_stock') AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn record_coming(&self, response: &ComingResponse) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let exists = sqlx::query_scalar::<_, Uuid>("SELECT id FROM fish_catches WHERE id = $1 FOR UPDATE")
            .bind(*response.catch_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("catch {}", response.catch_id)));
        }
        let inserted = sqlx::query(
            "INSERT INTO coming_responses (catch_id, phone, lat, lon, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (catch_id, phone) DO NOTHING",
        )
        .bind(*response.catch_id.as_uuid())
        .bind(&response.phone)
        .bind(response.location.map(|p| p.lat))
        .bind(response.location.map(|p| p.lon))
        .bind(response.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?
        .rows_affected()
            == 1;
        if inserted {
            sqlx::query("UPDATE fish_catches SET customers_coming = customers_coming + 1 WHERE id = $1")
                .bind(*response.catch_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(inserted)
    }

    async fn coming_responses(
        &self,
        catch_id: CatchId,
    ) -> Result<Vec<ComingResponse>, StoreError> {
        let rows = sqlx::query_as::<_, ComingRow>(
            "SELECT catch_id, phone, lat, lon, created_at FROM coming_responses \
             WHERE catch_id = $1 ORDER BY created_at",
        )
        .bind(*catch_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(ComingResponse::from).collect())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert_if_absent(&self, alert: &FishAlert) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO fish_alerts (id, subscription_id, catch_id, phone, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (subscription_id, catch_id) DO NOTHING",
        )
        .bind(*alert.id.as_uuid())
        .bind(*alert.subscription_id.as_uuid())
        .bind(*alert.catch_id.as_uuid())
        .bind(&alert.phone)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn alert_by_id(&self, id: AlertId) -> Result<Option<FishAlert>, StoreError> {
        let row = sqlx::query_as::<_, AlertRow>(concat!("SELECT ", alert_cols!(), " FROM fish_alerts a WHERE a.id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(FishAlert::from))
    }

    async fn pending_alerts(
        &self,
        frequency: DeliveryFrequency,
    ) -> Result<Vec<FishAlert>, StoreError> {
        let rows = sqlx::query_as::<_, AlertRow>(concat!(
            "SELECT ",
            alert_cols!(),
            " FROM fish_alerts a JOIN fish_subscriptions s ON s.id = a.subscription_id \
             WHERE a.sent_at IS NULL AND a.failed_at IS NULL \
             AND s.frequency = $1 AND s.active AND NOT s.paused \
             ORDER BY a.created_at"
        ))
        .bind(frequency.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(FishAlert::from).collect())
    }

    async fn mark_alert_sent(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
        provider_message_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE fish_alerts SET sent_at = GREATEST($2, created_at), provider_message_id = $3 \
             WHERE id = $1 AND sent_at IS NULL AND failed_at IS NULL",
        )
        .bind(*id.as_uuid())
        .bind(at)
        .bind(provider_message_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_alert_failed(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE fish_alerts SET failed_at = GREATEST($2, created_at), failure_reason = $3 \
             WHERE id = $1 AND failed_at IS NULL",
        )
        .bind(*id.as_uuid())
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_alert_clicked(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE fish_alerts SET clicked_at = GREATEST($2, created_at) \
             WHERE id = $1 AND clicked_at IS NULL",
        )
        .bind(*id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_receipt(&self, receipt: &DeliveryReceipt) -> Result<bool, StoreError> {
        let query = match receipt.status {
            ReceiptStatus::Sent => return Ok(false),
            ReceiptStatus::Delivered | ReceiptStatus::Read => sqlx::query(
                "UPDATE fish_alerts SET delivered_at = GREATEST($2, created_at) \
                 WHERE provider_message_id = $1 AND delivered_at IS NULL",
            )
            .bind(&receipt.provider_message_id)
            .bind(receipt.timestamp),
            ReceiptStatus::Failed => sqlx::query(
                "UPDATE fish_alerts SET failed_at = GREATEST($2, created_at), failure_reason = $3 \
                 WHERE provider_message_id = $1 AND failed_at IS NULL",
            )
            .bind(&receipt.provider_message_id)
            .bind(receipt.timestamp)
            .bind(receipt.error.as_deref().unwrap_or("provider reported failure")),
        };
        let result = query.execute(&self.pool).await.map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_alert_for_retry(&self, id: AlertId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE fish_alerts SET failed_at = NULL, sent_at = NULL, failure_reason = NULL, \
             provider_message_id = NULL WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("alert {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl AgreementStore for PgStore {
    async fn insert_agreement(&self, agreement: &Agreement) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agreements \
             (id, creator_phone, counterparty_phone, direction, amount, purpose, due_date, status, \
              reminded_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(*agreement.id.as_uuid())
        .bind(&agreement.creator_phone)
        .bind(&agreement.counterparty_phone)
        .bind(agreement.direction.as_str())
        .bind(agreement.amount)
        .bind(&agreement.purpose)
        .bind(agreement.due_date)
        .bind(agreement.status.as_str())
        .bind(agreement.reminded_at)
        .bind(agreement.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn agreement_by_id(&self, id: AgreementId) -> Result<Option<Agreement>, StoreError> {
        sqlx::query_as::<_, AgreementRow>(concat!("SELECT ", agreement_cols!(), " FROM agreements WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(Agreement::try_from)
            .transpose()
    }

    async fn resolve_agreement(
        &self,
        id: AgreementId,
        status: AgreementStatus,
    ) -> Result<Option<Agreement>, StoreError> {
        let row = sqlx::query_as::<_, AgreementRow>(concat!(
            "UPDATE agreements SET status = $2 WHERE id = $1 AND status = 'pending' RETURNING ",
            agreement_cols!()
        ))
        .bind(*id.as_uuid())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => Agreement::try_from(row).map(Some),
            None if self.agreement_by_id(id).await?.is_some() => Ok(None),
            None => Err(StoreError::NotFound(format!("agreement {id}"))),
        }
    }

    async fn agreements_due(&self, until: NaiveDate) -> Result<Vec<Agreement>, StoreError> {
        let rows = sqlx::query_as::<_, AgreementRow>(concat!(
            "SELECT ",
            agreement_cols!(),
            " FROM agreements WHERE status = 'accepted' AND reminded_at IS NULL AND due_date <= $1 \
             ORDER BY due_date"
        ))
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        convert_all(rows)
    }

    async fn mark_reminded(&self, id: AgreementId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE agreements SET reminded_at = COALESCE(reminded_at, $2) WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl JobPostStore for PgStore {
    async fn insert_job_post(&self, post: &JobPost) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_posts (id, employer_phone, title, daily_pay, lat, lon, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(*post.id.as_uuid())
        .bind(&post.employer_phone)
        .bind(&post.title)
        .bind(post.daily_pay)
        .bind(post.location.map(|p| p.lat))
        .bind(post.location.map(|p| p.lon))
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

/// Durable job queue on the `jobs` table.
///
/// A claim leases the row for five minutes; a worker that dies mid-job
/// lets the lease lapse and the job becomes claimable again.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    /// Creates a queue over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<i64, QueueError> {
        let payload = serde_json::to_value(&job).map_err(|e| QueueError::Backend(e.to_string()))?;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (payload, run_at, ordering_key) \
             VALUES ($1, now() + make_interval(secs => $2), $3) RETURNING id",
        )
        .bind(payload)
        .bind(delay.as_secs_f64())
        .bind(job.ordering_key())
        .fetch_one(&self.pool)
        .await
        .map_err(queue_backend)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let Some((id, payload, attempts)) = sqlx::query_as::<_, (i64, serde_json::Value, i32)>(
            "UPDATE jobs SET locked_until = now() + make_interval(secs => $1) \
             WHERE id = ( \
                 SELECT j.id FROM jobs j \
                 WHERE j.run_at <= now() AND (j.locked_until IS NULL OR j.locked_until < now()) \
                   AND (j.ordering_key IS NULL OR NOT EXISTS ( \
                       SELECT 1 FROM jobs e WHERE e.ordering_key = j.ordering_key AND e.id < j.id)) \
                 ORDER BY j.run_at, j.id FOR UPDATE OF j SKIP LOCKED LIMIT 1 \
             ) RETURNING id, payload, attempts",
        )
        .bind(JOB_LEASE_SECS)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_backend)?
        else {
            return Ok(None);
        };

        match serde_json::from_value::<Job>(payload) {
            Ok(job) => Ok(Some(QueuedJob {
                id,
                job,
                attempts: u32::try_from(attempts).unwrap_or(0),
            })),
            Err(e) => {
                // An undecodable payload can never succeed; drop it.
                self.ack(id).await?;
                Err(QueueError::Corrupt {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(queue_backend)?;
        Ok(())
    }

    async fn fail(&self, id: i64, retry_in: Duration) -> Result<FailOutcome, QueueError> {
        let attempts = sqlx::query_scalar::<_, i32>(
            "UPDATE jobs SET attempts = attempts + 1, locked_until = NULL, \
             run_at = now() + make_interval(secs => $2) WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .bind(retry_in.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_backend)?;

        match attempts.map(|a| u32::try_from(a).unwrap_or(u32::MAX)) {
            Some(a) if a < MAX_ATTEMPTS => Ok(FailOutcome::Retrying),
            Some(_) => {
                self.ack(id).await?;
                Ok(FailOutcome::Dead)
            }
            None => Ok(FailOutcome::Dead),
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(queue_backend)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn has_pending(&self, key: &str) -> Result<bool, QueueError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM jobs WHERE ordering_key = $1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(queue_backend)
    }
}
