//! In-memory store backend.
//!
//! Each table is a `HashMap` behind its own [`tokio::sync::RwLock`], so
//! unrelated tables never contend. Used when persistence is disabled and
//! as the fake in every test.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{
    AgreementStore, AlertStore, CatchStore, JobPostStore, ProcessedStore, SessionStore,
    StoreError, SubscriptionStore,
};
use crate::domain::geo::BoundingBox;
use crate::domain::{
    Agreement, AgreementId, AgreementStatus, AlertId, CatchId, CatchStatus, ComingResponse,
    DeliveryFrequency, DeliveryReceipt, FishAlert, FishCatch, FishSubscription, FishTypeId,
    JobPost, JobPostId, ReceiptStatus, Session, SubscriptionId,
};

/// Process-local implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    processed: RwLock<HashMap<String, DateTime<Utc>>>,
    subscriptions: RwLock<HashMap<SubscriptionId, FishSubscription>>,
    catches: RwLock<HashMap<CatchId, FishCatch>>,
    coming: RwLock<Vec<ComingResponse>>,
    alerts: RwLock<HashMap<AlertId, FishAlert>>,
    agreements: RwLock<HashMap<AgreementId, Agreement>>,
    jobs: RwLock<HashMap<JobPostId, JobPost>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every alert (test and diagnostics helper).
    pub async fn all_alerts(&self) -> Vec<FishAlert> {
        self.alerts.read().await.values().cloned().collect()
    }

    /// Snapshot of every agreement.
    pub async fn all_agreements(&self) -> Vec<Agreement> {
        self.agreements.read().await.values().cloned().collect()
    }

    /// Snapshot of every job post.
    pub async fn all_job_posts(&self) -> Vec<JobPost> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Number of durable dedup markers.
    pub async fn processed_count(&self) -> usize {
        self.processed.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_or_create(&self, phone: &str) -> Result<Session, StoreError> {
        if let Some(session) = self.sessions.read().await.get(phone) {
            return Ok(session.clone());
        }
        let mut map = self.sessions.write().await;
        Ok(map
            .entry(phone.to_string())
            .or_insert_with(|| Session::new(phone))
            .clone())
    }

    async fn save(&self, session: &Session) -> Result<Session, StoreError> {
        let mut map = self.sessions.write().await;
        let stored_version = map.get(&session.phone).map_or(0, |s| s.version);
        if stored_version != session.version {
            return Err(StoreError::Conflict {
                phone: session.phone.clone(),
                expected: session.version,
            });
        }
        let mut saved = session.clone();
        saved.version = stored_version.saturating_add(1);
        saved.last_activity_at = Utc::now();
        map.insert(saved.phone.clone(), saved.clone());
        Ok(saved)
    }
}

#[async_trait]
impl ProcessedStore for MemoryStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.processed.read().await.contains_key(message_id))
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut map = self.processed.write().await;
        if map.contains_key(message_id) {
            return Ok(false);
        }
        map.insert(message_id.to_string(), at);
        Ok(true)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert_subscription(&self, sub: &FishSubscription) -> Result<(), StoreError> {
        self.subscriptions.write().await.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn active_subscription_for(
        &self,
        phone: &str,
    ) -> Result<Option<FishSubscription>, StoreError> {
        let map = self.subscriptions.read().await;
        Ok(map
            .values()
            .filter(|s| s.phone == phone && s.active)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn set_subscription_state(
        &self,
        id: SubscriptionId,
        paused: bool,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut map = self.subscriptions.write().await;
        let sub = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {id}")))?;
        sub.paused = paused;
        sub.active = active;
        Ok(())
    }

    async fn listening_subscriptions_in(
        &self,
        area: &BoundingBox,
    ) -> Result<Vec<FishSubscription>, StoreError> {
        let map = self.subscriptions.read().await;
        Ok(map
            .values()
            .filter(|s| s.is_listening() && area.contains(&s.location))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatchStore for MemoryStore {
    async fn insert_catch(&self, catch: &FishCatch) -> Result<(), StoreError> {
        self.catches.write().await.insert(catch.id, catch.clone());
        Ok(())
    }

    async fn catch_by_id(&self, id: CatchId) -> Result<Option<FishCatch>, StoreError> {
        Ok(self.catches.read().await.get(&id).cloned())
    }

    async fn open_catches_by_seller(
        &self,
        seller: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<FishCatch>, StoreError> {
        let map = self.catches.read().await;
        let mut out: Vec<FishCatch> = map
            .values()
            .filter(|c| c.seller_phone == seller && c.is_open_at(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn count_catches_since(
        &self,
        seller: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let map = self.catches.read().await;
        let count = map
            .values()
            .filter(|c| c.seller_phone == seller && c.created_at >= since)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn set_catch_status(
        &self,
        id: CatchId,
        status: CatchStatus,
    ) -> Result<CatchStatus, StoreError> {
        let mut map = self.catches.write().await;
        let catch = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("catch {id}")))?;
        let previous = catch.status;
        catch.status = status;
        Ok(previous)
    }

    async fn open_catches_in(
        &self,
        area: &BoundingBox,
        fish_type: Option<FishTypeId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FishCatch>, StoreError> {
        let map = self.catches.read().await;
        Ok(map
            .values()
            .filter(|c| c.is_open_at(now))
            .filter(|c| fish_type.is_none_or(|t| c.fish_type == t))
            .filter(|c| c.location.as_ref().is_some_and(|at| area.contains(at)))
            .cloned()
            .collect())
    }

    async fn expire_catches(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut map = self.catches.write().await;
        let mut changed = 0u64;
        for catch in map.values_mut() {
            if catch.status.is_open() && catch.expires_at <= now {
                catch.status = CatchStatus::Expired;
                changed = changed.saturating_add(1);
            }
        }
        Ok(changed)
    }

    async fn record_coming(&self, response: &ComingResponse) -> Result<bool, StoreError> {
        let mut catches = self.catches.write().await;
        let catch = catches
            .get_mut(&response.catch_id)
            .ok_or_else(|| StoreError::NotFound(format!("catch {}", response.catch_id)))?;
        let mut coming = self.coming.write().await;
        if coming
            .iter()
            .any(|r| r.catch_id == response.catch_id && r.phone == response.phone)
        {
            return Ok(false);
        }
        coming.push(response.clone());
        catch.customers_coming = catch.customers_coming.saturating_add(1);
        Ok(true)
    }

    async fn coming_responses(
        &self,
        catch_id: CatchId,
    ) -> Result<Vec<ComingResponse>, StoreError> {
        let coming = self.coming.read().await;
        Ok(coming
            .iter()
            .filter(|r| r.catch_id == catch_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert_if_absent(&self, alert: &FishAlert) -> Result<bool, StoreError> {
        let mut map = self.alerts.write().await;
        if map
            .values()
            .any(|a| a.subscription_id == alert.subscription_id && a.catch_id == alert.catch_id)
        {
            return Ok(false);
        }
        map.insert(alert.id, alert.clone());
        Ok(true)
    }

    async fn alert_by_id(&self, id: AlertId) -> Result<Option<FishAlert>, StoreError> {
        Ok(self.alerts.read().await.get(&id).cloned())
    }

    async fn pending_alerts(
        &self,
        frequency: DeliveryFrequency,
    ) -> Result<Vec<FishAlert>, StoreError> {
        let subs = self.subscriptions.read().await;
        let alerts = self.alerts.read().await;
        let mut out: Vec<FishAlert> = alerts
            .values()
            .filter(|a| a.is_pending())
            .filter(|a| {
                subs.get(&a.subscription_id)
                    .is_some_and(|s| s.frequency == frequency && s.is_listening())
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn mark_alert_sent(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
        provider_message_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut map = self.alerts.write().await;
        Ok(map
            .get_mut(&id)
            .is_some_and(|a| a.mark_sent(at, provider_message_id)))
    }

    async fn mark_alert_failed(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let mut map = self.alerts.write().await;
        Ok(map.get_mut(&id).is_some_and(|a| a.mark_failed(at, reason)))
    }

    async fn mark_alert_clicked(
        &self,
        id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut map = self.alerts.write().await;
        Ok(map.get_mut(&id).is_some_and(|a| a.mark_clicked(at)))
    }

    async fn apply_receipt(&self, receipt: &DeliveryReceipt) -> Result<bool, StoreError> {
        let mut map = self.alerts.write().await;
        let Some(alert) = map
            .values_mut()
            .find(|a| a.provider_message_id.as_deref() == Some(&receipt.provider_message_id))
        else {
            return Ok(false);
        };
        Ok(match receipt.status {
            ReceiptStatus::Sent => false,
            ReceiptStatus::Delivered | ReceiptStatus::Read => {
                alert.mark_delivered(receipt.timestamp)
            }
            ReceiptStatus::Failed => alert.mark_failed(
                receipt.timestamp,
                receipt.error.as_deref().unwrap_or("provider reported failure"),
            ),
        })
    }

    async fn reset_alert_for_retry(&self, id: AlertId) -> Result<(), StoreError> {
        let mut map = self.alerts.write().await;
        let alert = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        alert.reset_for_retry();
        Ok(())
    }
}

#[async_trait]
impl AgreementStore for MemoryStore {
    async fn insert_agreement(&self, agreement: &Agreement) -> Result<(), StoreError> {
        self.agreements
            .write()
            .await
            .insert(agreement.id, agreement.clone());
        Ok(())
    }

    async fn agreement_by_id(&self, id: AgreementId) -> Result<Option<Agreement>, StoreError> {
        Ok(self.agreements.read().await.get(&id).cloned())
    }

    async fn resolve_agreement(
        &self,
        id: AgreementId,
        status: AgreementStatus,
    ) -> Result<Option<Agreement>, StoreError> {
        let mut map = self.agreements.write().await;
        let agreement = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("agreement {id}")))?;
        if agreement.status != AgreementStatus::Pending {
            return Ok(None);
        }
        agreement.status = status;
        Ok(Some(agreement.clone()))
    }

    async fn agreements_due(&self, until: NaiveDate) -> Result<Vec<Agreement>, StoreError> {
        let map = self.agreements.read().await;
        Ok(map
            .values()
            .filter(|a| {
                a.status == AgreementStatus::Accepted
                    && a.reminded_at.is_none()
                    && a.due_date <= until
            })
            .cloned()
            .collect())
    }

    async fn mark_reminded(&self, id: AgreementId, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(agreement) = self.agreements.write().await.get_mut(&id) {
            agreement.reminded_at.get_or_insert(at);
        }
        Ok(())
    }
}

#[async_trait]
impl JobPostStore for MemoryStore {
    async fn insert_job_post(&self, post: &JobPost) -> Result<(), StoreError> {
        self.jobs.write().await.insert(post.id, post.clone());
        Ok(())
    }
}
