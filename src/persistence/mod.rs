//! Persistence layer: store traits plus in-memory and PostgreSQL backends.
//!
//! Every consumer depends on the traits below through [`Stores`], so flows,
//! the dedup gate and the alert engine are identical against either backend.
//! The in-memory backend is used when persistence is disabled and in tests.

pub mod memory;
pub mod models;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::geo::BoundingBox;
use crate::domain::{
    Agreement, AgreementId, AgreementStatus, AlertId, CatchId, CatchStatus, ComingResponse,
    DeliveryFrequency, DeliveryReceipt, FishAlert, FishCatch, FishSubscription, FishTypeId,
    JobPost, Session, SubscriptionId,
};

/// Errors raised by any store implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend failed (connection, query, constraint).
    #[error("backend failure: {0}")]
    Backend(String),

    /// Optimistic update lost against a concurrent writer.
    #[error("session for {phone} changed concurrently (expected version {expected})")]
    Conflict {
        /// Session key.
        phone: String,
        /// Version the writer started from.
        expected: i64,
    },

    /// Referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Durable per-sender session records.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Returns the session for `phone`, creating an idle main-menu session
    /// on first contact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn load_or_create(&self, phone: &str) -> Result<Session, StoreError>;

    /// Saves `session` if the stored version still equals
    /// `session.version`, returning the saved copy with its bumped version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if another writer saved first.
    async fn save(&self, session: &Session) -> Result<Session, StoreError>;
}

/// Durable tier of the deduplication gate.
#[async_trait]
pub trait ProcessedStore: Send + Sync + std::fmt::Debug {
    /// `true` if `message_id` was recorded before.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError>;

    /// Records `message_id`; returns `true` only for the call that inserted
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn mark_processed(&self, message_id: &str, at: DateTime<Utc>)
    -> Result<bool, StoreError>;
}

/// Fish alert subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new subscription.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_subscription(&self, sub: &FishSubscription) -> Result<(), StoreError>;

    /// Most recent active subscription of `phone`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn active_subscription_for(
        &self,
        phone: &str,
    ) -> Result<Option<FishSubscription>, StoreError>;

    /// Updates the paused/active flags.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    async fn set_subscription_state(
        &self,
        id: SubscriptionId,
        paused: bool,
        active: bool,
    ) -> Result<(), StoreError>;

    /// Active, unpaused subscriptions whose centre lies inside `area`.
    /// Callers apply the exact distance and species filters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn listening_subscriptions_in(
        &self,
        area: &BoundingBox,
    ) -> Result<Vec<FishSubscription>, StoreError>;
}

/// Posted catches and buyer responses.
#[async_trait]
pub trait CatchStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new catch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_catch(&self, catch: &FishCatch) -> Result<(), StoreError>;

    /// Loads one catch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn catch_by_id(&self, id: CatchId) -> Result<Option<FishCatch>, StoreError>;

    /// Catches posted by `seller` that are still open at `now`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn open_catches_by_seller(
        &self,
        seller: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<FishCatch>, StoreError>;

    /// Number of catches `seller` posted since `since`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn count_catches_since(
        &self,
        seller: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Sets the status and returns the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    async fn set_catch_status(
        &self,
        id: CatchId,
        status: CatchStatus,
    ) -> Result<CatchStatus, StoreError>;

    /// Open catches inside `area`, optionally restricted to one species.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn open_catches_in(
        &self,
        area: &BoundingBox,
        fish_type: Option<FishTypeId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FishCatch>, StoreError>;

    /// Marks every open catch whose expiry passed as expired, returning
    /// how many changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn expire_catches(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Records an "I'm coming" answer; `true` if it is the buyer's first
    /// for this catch (and the catch counter was incremented).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn record_coming(&self, response: &ComingResponse) -> Result<bool, StoreError>;

    /// Every "I'm coming" answer for `catch_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn coming_responses(&self, catch_id: CatchId)
    -> Result<Vec<ComingResponse>, StoreError>;
}

/// Alert rows and their delivery lifecycle.
#[async_trait]
pub trait AlertStore: Send + Sync + std::fmt::Debug {
    /// Inserts `alert` unless one already exists for the same
    /// subscription and catch. Returns `true` if inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_alert_if_absent(&self, alert: &FishAlert) -> Result<bool, StoreError>;

    /// Loads one alert.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn alert_by_id(&self, id: AlertId) -> Result<Option<FishAlert>, StoreError>;

    /// Pending alerts of subscriptions with the given delivery frequency.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn pending_alerts(
        &self,
        frequency: DeliveryFrequency,
    ) -> Result<Vec<FishAlert>, StoreError>;

    /// Sets `sent_at` (first call wins).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn mark_alert_sent(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
        provider_message_id: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Sets `failed_at` and the reason (first call wins).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn mark_alert_failed(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Sets `clicked_at` (first call wins).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn mark_alert_clicked(&self, id: AlertId, at: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Applies a provider receipt to the alert sent with that provider
    /// message id. Returns `true` if an alert changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn apply_receipt(&self, receipt: &DeliveryReceipt) -> Result<bool, StoreError>;

    /// Clears `failed_at` and `sent_at` together so the alert can be sent
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    async fn reset_alert_for_retry(&self, id: AlertId) -> Result<(), StoreError>;
}

/// Lend/borrow agreements.
#[async_trait]
pub trait AgreementStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new agreement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_agreement(&self, agreement: &Agreement) -> Result<(), StoreError>;

    /// Loads one agreement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn agreement_by_id(&self, id: AgreementId) -> Result<Option<Agreement>, StoreError>;

    /// Moves a pending agreement to `status`; returns the updated row, or
    /// `None` if it was no longer pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    async fn resolve_agreement(
        &self,
        id: AgreementId,
        status: AgreementStatus,
    ) -> Result<Option<Agreement>, StoreError>;

    /// Accepted agreements due on or before `until` that have not been
    /// reminded yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn agreements_due(&self, until: NaiveDate) -> Result<Vec<Agreement>, StoreError>;

    /// Stamps `reminded_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn mark_reminded(&self, id: AgreementId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Job openings.
#[async_trait]
pub trait JobPostStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new job post.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_job_post(&self, post: &JobPost) -> Result<(), StoreError>;
}

/// Bundle of every store handle, cloned into services and flow handlers.
#[derive(Debug, Clone)]
pub struct Stores {
    /// Conversation sessions.
    pub sessions: Arc<dyn SessionStore>,
    /// Dedup markers.
    pub processed: Arc<dyn ProcessedStore>,
    /// Alert subscriptions.
    pub subscriptions: Arc<dyn SubscriptionStore>,
    /// Catches and responses.
    pub catches: Arc<dyn CatchStore>,
    /// Alert lifecycle.
    pub alerts: Arc<dyn AlertStore>,
    /// Agreements.
    pub agreements: Arc<dyn AgreementStore>,
    /// Job posts.
    pub jobs: Arc<dyn JobPostStore>,
}

impl Stores {
    /// Every store backed by one shared in-memory instance.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::memory(&Arc::new(memory::MemoryStore::new()))
    }

    /// Every store backed by the given in-memory instance.
    #[must_use]
    pub fn memory(store: &Arc<memory::MemoryStore>) -> Self {
        Self::from_backend(store)
    }

    /// Every store backed by PostgreSQL.
    #[must_use]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let pg = Arc::new(postgres::PgStore::new(pool));
        Self::from_backend(&pg)
    }

    fn from_backend<B>(backend: &Arc<B>) -> Self
    where
        B: SessionStore
            + ProcessedStore
            + SubscriptionStore
            + CatchStore
            + AlertStore
            + AgreementStore
            + JobPostStore
            + 'static,
    {
        Self {
            sessions: Arc::clone(backend) as Arc<dyn SessionStore>,
            processed: Arc::clone(backend) as Arc<dyn ProcessedStore>,
            subscriptions: Arc::clone(backend) as Arc<dyn SubscriptionStore>,
            catches: Arc::clone(backend) as Arc<dyn CatchStore>,
            alerts: Arc::clone(backend) as Arc<dyn AlertStore>,
            agreements: Arc::clone(backend) as Arc<dyn AgreementStore>,
            jobs: Arc::clone(backend) as Arc<dyn JobPostStore>,
        }
    }
}
