//! Database rows and their conversion into domain values.
//!
//! Rows mirror `migrations/` column for column. Conversion is fallible:
//! a row that no longer satisfies a domain invariant surfaces as
//! [`StoreError::Corrupt`] instead of being silently patched.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::StoreError;
use crate::domain::{
    Agreement, AgreementDirection, AgreementStatus, CatchStatus, ComingResponse,
    DeliveryFrequency, FishAlert, FishCatch, FishSubscription, FishTypeFilter, FishTypeId,
    GeoPoint, MediaRef, Radius, Session,
};

fn corrupt(table: &str, id: impl std::fmt::Display, what: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{table} {id}: {what}"))
}

fn point(lat: Option<f64>, lon: Option<f64>) -> Option<Result<GeoPoint, crate::domain::DomainError>> {
    Some(GeoPoint::new(lat?, lon?))
}

/// A `conversation_sessions` row.
#[derive(Debug, sqlx::FromRow)]
pub struct SessionRow {
    /// Sender phone.
    pub phone: String,
    /// Flow id.
    pub current_flow: String,
    /// Step id.
    pub current_step: Option<String>,
    /// Draft JSON.
    pub temp_data: Option<serde_json::Value>,
    /// Last activity.
    pub last_activity_at: DateTime<Utc>,
    /// CAS version.
    pub version: i64,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self::from_columns(
            row.phone,
            &row.current_flow,
            row.current_step,
            row.temp_data,
            row.last_activity_at,
            row.version,
        )
    }
}

/// A `fish_subscriptions` row.
#[derive(Debug, sqlx::FromRow)]
pub struct SubscriptionRow {
    /// Subscription id.
    pub id: Uuid,
    /// Subscriber phone.
    pub phone: String,
    /// Centre latitude.
    pub lat: f64,
    /// Centre longitude.
    pub lon: f64,
    /// Radius in km.
    pub radius_km: f64,
    /// Species filter disabled.
    pub all_fish_types: bool,
    /// Explicit species.
    pub fish_type_ids: Vec<i32>,
    /// Frequency id.
    pub frequency: String,
    /// Paused flag.
    pub paused: bool,
    /// Active flag.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for FishSubscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let location = GeoPoint::new(row.lat, row.lon).map_err(|e| corrupt("subscription", row.id, e))?;
        let radius = Radius::new(row.radius_km).map_err(|e| corrupt("subscription", row.id, e))?;
        let fish_types = if row.all_fish_types {
            FishTypeFilter::All
        } else {
            FishTypeFilter::only(row.fish_type_ids.into_iter().map(FishTypeId))
                .map_err(|e| corrupt("subscription", row.id, e))?
        };
        let frequency = DeliveryFrequency::parse(&row.frequency)
            .ok_or_else(|| corrupt("subscription", row.id, format!("frequency {}", row.frequency)))?;
        Ok(Self {
            id: row.id.into(),
            phone: row.phone,
            location,
            radius,
            fish_types,
            frequency,
            paused: row.paused,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

/// A `fish_catches` row.
#[derive(Debug, sqlx::FromRow)]
pub struct CatchRow {
    /// Catch id.
    pub id: Uuid,
    /// Seller phone.
    pub seller_phone: String,
    /// Species id.
    pub fish_type: i32,
    /// Latitude, when shared.
    pub lat: Option<f64>,
    /// Longitude, when shared.
    pub lon: Option<f64>,
    /// Price in paise per kg.
    pub price_per_kg: i64,
    /// Quantity in kg.
    pub quantity_kg: f64,
    /// Status id.
    pub status: String,
    /// Photo reference JSON.
    pub photo: Option<serde_json::Value>,
    /// Buyers on the way.
    pub customers_coming: i32,
    /// Posting time.
    pub created_at: DateTime<Utc>,
    /// Listing end.
    pub expires_at: DateTime<Utc>,
}

impl TryFrom<CatchRow> for FishCatch {
    type Error = StoreError;

    fn try_from(row: CatchRow) -> Result<Self, Self::Error> {
        let location = point(row.lat, row.lon)
            .transpose()
            .map_err(|e| corrupt("catch", row.id, e))?;
        let status = CatchStatus::parse(&row.status)
            .ok_or_else(|| corrupt("catch", row.id, format!("status {}", row.status)))?;
        let photo = row
            .photo
            .map(serde_json::from_value::<MediaRef>)
            .transpose()
            .map_err(|e| corrupt("catch", row.id, e))?;
        Ok(Self {
            id: row.id.into(),
            seller_phone: row.seller_phone,
            fish_type: FishTypeId(row.fish_type),
            location,
            price_per_kg: row.price_per_kg,
            quantity_kg: row.quantity_kg,
            status,
            photo,
            customers_coming: row.customers_coming,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

/// A `coming_responses` row.
#[derive(Debug, sqlx::FromRow)]
pub struct ComingRow {
    /// Catch id.
    pub catch_id: Uuid,
    /// Buyer phone.
    pub phone: String,
    /// Buyer latitude.
    pub lat: Option<f64>,
    /// Buyer longitude.
    pub lon: Option<f64>,
    /// Response time.
    pub created_at: DateTime<Utc>,
}

impl From<ComingRow> for ComingResponse {
    fn from(row: ComingRow) -> Self {
        Self {
            catch_id: row.catch_id.into(),
            phone: row.phone,
            location: point(row.lat, row.lon).and_then(Result::ok),
            created_at: row.created_at,
        }
    }
}

/// A `fish_alerts` row.
#[derive(Debug, sqlx::FromRow)]
pub struct AlertRow {
    /// Alert id.
    pub id: Uuid,
    /// Matching subscription.
    pub subscription_id: Uuid,
    /// Matching catch.
    pub catch_id: Uuid,
    /// Recipient.
    pub phone: String,
    /// Provider id of the sent message.
    pub provider_message_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Send time.
    pub sent_at: Option<DateTime<Utc>>,
    /// Delivery time.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Click time.
    pub clicked_at: Option<DateTime<Utc>>,
    /// Failure time.
    pub failed_at: Option<DateTime<Utc>>,
    /// Failure reason.
    pub failure_reason: Option<String>,
}

impl From<AlertRow> for FishAlert {
    fn from(row: AlertRow) -> Self {
        Self {
            id: row.id.into(),
            subscription_id: row.subscription_id.into(),
            catch_id: row.catch_id.into(),
            phone: row.phone,
            provider_message_id: row.provider_message_id,
            created_at: row.created_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            clicked_at: row.clicked_at,
            failed_at: row.failed_at,
            failure_reason: row.failure_reason,
        }
    }
}

/// An `agreements` row.
#[derive(Debug, sqlx::FromRow)]
pub struct AgreementRow {
    /// Agreement id.
    pub id: Uuid,
    /// Creator phone.
    pub creator_phone: String,
    /// Counterparty phone.
    pub counterparty_phone: String,
    /// Direction id.
    pub direction: String,
    /// Amount in paise.
    pub amount: i64,
    /// Purpose.
    pub purpose: String,
    /// Due date.
    pub due_date: NaiveDate,
    /// Status id.
    pub status: String,
    /// Reminder time.
    pub reminded_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AgreementRow> for Agreement {
    type Error = StoreError;

    fn try_from(row: AgreementRow) -> Result<Self, Self::Error> {
        let direction = AgreementDirection::parse(&row.direction)
            .ok_or_else(|| corrupt("agreement", row.id, format!("direction {}", row.direction)))?;
        let status = AgreementStatus::parse(&row.status)
            .ok_or_else(|| corrupt("agreement", row.id, format!("status {}", row.status)))?;
        Ok(Self {
            id: row.id.into(),
            creator_phone: row.creator_phone,
            counterparty_phone: row.counterparty_phone,
            direction,
            amount: row.amount,
            purpose: row.purpose,
            due_date: row.due_date,
            status,
            reminded_at: row.reminded_at,
            created_at: row.created_at,
        })
    }
}

/// Converts every row, failing on the first corrupt one.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if any row fails to convert.
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
