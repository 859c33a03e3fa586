//! Fresh-fish marketplace model: catalog, subscriptions, catches, alerts.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::GeoPoint;
use super::ids::{AlertId, CatchId, SubscriptionId};
use super::message::MediaRef;
use super::DomainError;

/// Numeric identifier of a fish species in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FishTypeId(pub i32);

impl fmt::Display for FishTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FishType {
    /// Stable id stored on subscriptions and catches.
    pub id: FishTypeId,
    /// English display name.
    pub name: &'static str,
    /// Malayalam market name.
    pub local_name: &'static str,
}

/// Species offered in conversational pickers. Kept to nine entries so the
/// catalog plus an "all fish" row fits a single provider list message.
pub const FISH_TYPES: &[FishType] = &[
    FishType { id: FishTypeId(1), name: "Sardine", local_name: "Mathi" },
    FishType { id: FishTypeId(2), name: "Mackerel", local_name: "Ayala" },
    FishType { id: FishTypeId(3), name: "Seer Fish", local_name: "Neymeen" },
    FishType { id: FishTypeId(4), name: "Pearl Spot", local_name: "Karimeen" },
    FishType { id: FishTypeId(5), name: "Tuna", local_name: "Choora" },
    FishType { id: FishTypeId(6), name: "Prawns", local_name: "Chemmeen" },
    FishType { id: FishTypeId(7), name: "Anchovy", local_name: "Natholi" },
    FishType { id: FishTypeId(8), name: "Pomfret", local_name: "Avoli" },
    FishType { id: FishTypeId(9), name: "Squid", local_name: "Koonthal" },
];

/// Looks up a catalog entry by id.
#[must_use]
pub fn fish_type(id: FishTypeId) -> Option<&'static FishType> {
    FISH_TYPES.iter().find(|t| t.id == id)
}

/// Display label for a fish type id, falling back to the raw id.
#[must_use]
pub fn fish_label(id: FishTypeId) -> String {
    fish_type(id).map_or_else(
        || format!("Fish #{id}"),
        |t| format!("{} ({})", t.name, t.local_name),
    )
}

/// Alert radius in kilometres, always within [`Radius::MIN_KM`]..=[`Radius::MAX_KM`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Radius(f64);

impl Radius {
    /// Smallest accepted radius.
    pub const MIN_KM: f64 = 1.0;
    /// Largest accepted radius.
    pub const MAX_KM: f64 = 50.0;

    /// Validates and wraps a radius.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidRadius`] outside `1..=50` km.
    pub fn new(km: f64) -> Result<Self, DomainError> {
        if !km.is_finite() || !(Self::MIN_KM..=Self::MAX_KM).contains(&km) {
            return Err(DomainError::InvalidRadius(km));
        }
        Ok(Self(km))
    }

    /// Radius in kilometres.
    #[must_use]
    pub const fn km(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Radius {
    type Error = DomainError;

    fn try_from(km: f64) -> Result<Self, Self::Error> {
        Self::new(km)
    }
}

impl From<Radius> for f64 {
    fn from(r: Radius) -> Self {
        r.0
    }
}

/// Which species a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ids", rename_all = "snake_case")]
pub enum FishTypeFilter {
    /// Every species.
    All,
    /// A non-empty explicit set.
    Only(BTreeSet<FishTypeId>),
}

impl FishTypeFilter {
    /// Builds an explicit filter.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::EmptyFishTypeFilter`] for an empty set; use
    /// [`FishTypeFilter::All`] instead.
    pub fn only(ids: impl IntoIterator<Item = FishTypeId>) -> Result<Self, DomainError> {
        let set: BTreeSet<_> = ids.into_iter().collect();
        if set.is_empty() {
            return Err(DomainError::EmptyFishTypeFilter);
        }
        Ok(Self::Only(set))
    }

    /// Returns `true` if a catch of `fish_type` passes the filter.
    #[must_use]
    pub fn matches(&self, fish_type: FishTypeId) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(&fish_type),
        }
    }

    /// Explicit ids, empty for [`FishTypeFilter::All`].
    #[must_use]
    pub fn ids(&self) -> Vec<FishTypeId> {
        match self {
            Self::All => Vec::new(),
            Self::Only(ids) => ids.iter().copied().collect(),
        }
    }
}

/// How a subscriber wants matching alerts delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFrequency {
    /// Send each alert as soon as a catch matches.
    Immediate,
    /// One digest every morning.
    MorningOnly,
    /// Morning and afternoon digests.
    TwiceDaily,
    /// One digest a week.
    WeeklyDigest,
}

impl DeliveryFrequency {
    /// Every variant, in menu order.
    pub const ALL: [Self; 4] = [
        Self::Immediate,
        Self::MorningOnly,
        Self::TwiceDaily,
        Self::WeeklyDigest,
    ];

    /// Storage and selection-id form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::MorningOnly => "morning_only",
            Self::TwiceDaily => "twice_daily",
            Self::WeeklyDigest => "weekly_digest",
        }
    }

    /// Parses the storage form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }

    /// Human label used in pickers.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Immediate => "Instantly",
            Self::MorningOnly => "Mornings only",
            Self::TwiceDaily => "Twice a day",
            Self::WeeklyDigest => "Weekly digest",
        }
    }

    /// `false` for frequencies whose alerts wait for a digest sweep.
    #[must_use]
    pub const fn is_immediate(self) -> bool {
        matches!(self, Self::Immediate)
    }
}

/// A standing request to be alerted about nearby catches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FishSubscription {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Subscriber phone (E.164 without `+`).
    pub phone: String,
    /// Centre of the alert area.
    pub location: GeoPoint,
    /// Alert area radius.
    pub radius: Radius,
    /// Species filter.
    pub fish_types: FishTypeFilter,
    /// Delivery preference.
    pub frequency: DeliveryFrequency,
    /// Temporarily muted by the subscriber.
    pub paused: bool,
    /// `false` once the subscriber unsubscribes.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl FishSubscription {
    /// Creates an active, unpaused subscription.
    #[must_use]
    pub fn new(
        phone: impl Into<String>,
        location: GeoPoint,
        radius: Radius,
        fish_types: FishTypeFilter,
        frequency: DeliveryFrequency,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            phone: phone.into(),
            location,
            radius,
            fish_types,
            frequency,
            paused: false,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Active and not paused.
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.active && !self.paused
    }

    /// Returns the distance to `catch` if it falls inside this
    /// subscription's radius and passes the species filter.
    #[must_use]
    pub fn match_distance(&self, catch: &FishCatch) -> Option<f64> {
        let at = catch.location.as_ref()?;
        if !self.fish_types.matches(catch.fish_type) {
            return None;
        }
        let d = self.location.distance_km(at);
        (d <= self.radius.km()).then_some(d)
    }
}

/// Stock state of a posted catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchStatus {
    /// Plenty left.
    Available,
    /// Running out.
    LowStock,
    /// Nothing left.
    SoldOut,
    /// Past its listing window.
    Expired,
}

impl CatchStatus {
    /// Storage and selection-id form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::LowStock => "low_stock",
            Self::SoldOut => "sold_out",
            Self::Expired => "expired",
        }
    }

    /// Parses the storage form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Available, Self::LowStock, Self::SoldOut, Self::Expired]
            .into_iter()
            .find(|c| c.as_str() == s)
    }

    /// Buyers can still act on the listing.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Available | Self::LowStock)
    }
}

/// A seller's posted catch; the subject of alert fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FishCatch {
    /// Catch id.
    pub id: CatchId,
    /// Seller phone.
    pub seller_phone: String,
    /// Species.
    pub fish_type: FishTypeId,
    /// Landing/selling point. `None` means the catch cannot be matched.
    pub location: Option<GeoPoint>,
    /// Price per kilogram in paise.
    pub price_per_kg: i64,
    /// Quantity on offer in kilograms.
    pub quantity_kg: f64,
    /// Stock status.
    pub status: CatchStatus,
    /// Optional photo uploaded by the seller.
    pub photo: Option<MediaRef>,
    /// Buyers who answered "I'm coming".
    pub customers_coming: i32,
    /// Posting time.
    pub created_at: DateTime<Utc>,
    /// Listing expiry.
    pub expires_at: DateTime<Utc>,
}

impl FishCatch {
    /// `true` when buyers can still act on it at `now`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.expires_at > now
    }

    /// One-line summary used in list rows and digests.
    #[must_use]
    pub fn headline(&self) -> String {
        format!(
            "{} · {} /kg · {:.0} kg",
            fish_label(self.fish_type),
            format_rupees(self.price_per_kg),
            self.quantity_kg
        )
    }
}

/// Formats an amount in paise as rupees (`₹120` or `₹120.50`).
#[must_use]
pub fn format_rupees(paise: i64) -> String {
    let rupees = paise / 100;
    let rem = (paise % 100).abs();
    if rem == 0 {
        format!("₹{rupees}")
    } else {
        format!("₹{rupees}.{rem:02}")
    }
}

/// Notification state for one subscription × catch match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FishAlert {
    /// Alert id.
    pub id: AlertId,
    /// Matching subscription.
    pub subscription_id: SubscriptionId,
    /// Matched catch.
    pub catch_id: CatchId,
    /// Recipient phone (denormalized from the subscription).
    pub phone: String,
    /// Provider id of the outbound message, used to attribute receipts.
    pub provider_message_id: Option<String>,
    /// Creation time; every lifecycle timestamp is at or after it.
    pub created_at: DateTime<Utc>,
    /// Handed to the provider.
    pub sent_at: Option<DateTime<Utc>>,
    /// Provider reported delivery.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Recipient tapped the alert.
    pub clicked_at: Option<DateTime<Utc>>,
    /// Delivery failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Why delivery failed.
    pub failure_reason: Option<String>,
}

impl FishAlert {
    /// Creates a pending alert.
    #[must_use]
    pub fn new(subscription: &FishSubscription, catch_id: CatchId) -> Self {
        Self {
            id: AlertId::new(),
            subscription_id: subscription.id,
            catch_id,
            phone: subscription.phone.clone(),
            provider_message_id: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            clicked_at: None,
            failed_at: None,
            failure_reason: None,
        }
    }

    fn stamp(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.max(self.created_at)
    }

    /// Records the send. No-op if already sent or failed.
    pub fn mark_sent(&mut self, at: DateTime<Utc>, provider_message_id: Option<String>) -> bool {
        if self.sent_at.is_some() || self.failed_at.is_some() {
            return false;
        }
        self.sent_at = Some(self.stamp(at));
        self.provider_message_id = provider_message_id;
        true
    }

    /// Records a delivery receipt. No-op if already delivered.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }
        self.delivered_at = Some(self.stamp(at));
        true
    }

    /// Records engagement. No-op if already clicked.
    pub fn mark_clicked(&mut self, at: DateTime<Utc>) -> bool {
        if self.clicked_at.is_some() {
            return false;
        }
        self.clicked_at = Some(self.stamp(at));
        true
    }

    /// Records a failure. No-op if already failed.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, reason: impl Into<String>) -> bool {
        if self.failed_at.is_some() {
            return false;
        }
        self.failed_at = Some(self.stamp(at));
        self.failure_reason = Some(reason.into());
        true
    }

    /// Makes a failed alert eligible for another send attempt.
    pub fn reset_for_retry(&mut self) {
        self.failed_at = None;
        self.sent_at = None;
        self.failure_reason = None;
        self.provider_message_id = None;
    }

    /// Waiting for a digest or a deferred send.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.sent_at.is_none() && self.failed_at.is_none()
    }

    /// Nothing further will happen to this alert.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.failed_at.is_some() || (self.delivered_at.is_some() && self.clicked_at.is_some())
    }
}

/// A buyer's "I'm coming" answer to a catch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComingResponse {
    /// Catch the buyer is heading to.
    pub catch_id: CatchId,
    /// Buyer phone.
    pub phone: String,
    /// Buyer's last shared location, if any.
    pub location: Option<GeoPoint>,
    /// Response time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn point(lat: f64, lon: f64) -> GeoPoint {
        let Ok(p) = GeoPoint::new(lat, lon) else {
            panic!("valid coordinates");
        };
        p
    }

    fn radius(km: f64) -> Radius {
        let Ok(r) = Radius::new(km) else {
            panic!("valid radius");
        };
        r
    }

    fn catch_at(location: Option<GeoPoint>, fish_type: FishTypeId) -> FishCatch {
        let now = Utc::now();
        FishCatch {
            id: CatchId::new(),
            seller_phone: "919800000001".to_string(),
            fish_type,
            location,
            price_per_kg: 24_000,
            quantity_kg: 20.0,
            status: CatchStatus::Available,
            photo: None,
            customers_coming: 0,
            created_at: now,
            expires_at: now + Duration::hours(12),
        }
    }

    #[test]
    fn radius_bounds_are_enforced() {
        assert!(Radius::new(0.0).is_err());
        assert!(Radius::new(-3.0).is_err());
        assert!(Radius::new(50.5).is_err());
        assert!(Radius::new(1.0).is_ok());
        assert!(Radius::new(50.0).is_ok());
    }

    #[test]
    fn radius_deserialization_validates() {
        assert!(serde_json::from_str::<Radius>("0").is_err());
        assert!(serde_json::from_str::<Radius>("5").is_ok());
    }

    #[test]
    fn empty_explicit_filter_is_rejected() {
        assert!(FishTypeFilter::only(Vec::new()).is_err());
        let Ok(filter) = FishTypeFilter::only([FishTypeId(2)]) else {
            panic!("non-empty filter");
        };
        assert!(filter.matches(FishTypeId(2)));
        assert!(!filter.matches(FishTypeId(3)));
        assert!(FishTypeFilter::All.matches(FishTypeId(99)));
    }

    #[test]
    fn radius_filter_is_exact_at_the_boundary() {
        let centre = point(10.0, 76.0);
        let catch = catch_at(Some(point(10.03, 76.0)), FishTypeId(1));
        let d = centre.distance_km(&point(10.03, 76.0));
        let eps = 0.01;

        let inside = FishSubscription::new(
            "91",
            centre,
            radius(d + eps),
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        let outside = FishSubscription::new(
            "91",
            centre,
            radius(d - eps),
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        assert!(inside.match_distance(&catch).is_some());
        assert!(outside.match_distance(&catch).is_none());
    }

    #[test]
    fn catch_without_location_matches_nothing() {
        let sub = FishSubscription::new(
            "91",
            point(10.0, 76.0),
            radius(50.0),
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        assert!(sub.match_distance(&catch_at(None, FishTypeId(1))).is_none());
    }

    #[test]
    fn alert_timestamps_are_set_once_and_never_before_creation() {
        let sub = FishSubscription::new(
            "91",
            point(10.0, 76.0),
            radius(5.0),
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        let mut alert = FishAlert::new(&sub, CatchId::new());
        let early = alert.created_at - Duration::minutes(5);

        assert!(alert.mark_sent(early, Some("wamid.1".to_string())));
        assert_eq!(alert.sent_at, Some(alert.created_at));
        assert!(!alert.mark_sent(Utc::now(), None));
        assert_eq!(alert.provider_message_id.as_deref(), Some("wamid.1"));

        assert!(alert.mark_delivered(Utc::now()));
        assert!(!alert.is_terminal());
        assert!(alert.mark_clicked(Utc::now()));
        assert!(alert.is_terminal());
    }

    #[test]
    fn retry_clears_failed_and_sent_together() {
        let sub = FishSubscription::new(
            "91",
            point(10.0, 76.0),
            radius(5.0),
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        let mut alert = FishAlert::new(&sub, CatchId::new());
        assert!(alert.mark_failed(Utc::now(), "provider down"));
        assert!(!alert.mark_sent(Utc::now(), None));
        assert!(alert.is_terminal());

        alert.reset_for_retry();
        assert!(alert.is_pending());
        assert!(alert.mark_sent(Utc::now(), None));
    }

    #[test]
    fn frequency_round_trips_through_storage_form() {
        for f in DeliveryFrequency::ALL {
            assert_eq!(DeliveryFrequency::parse(f.as_str()), Some(f));
        }
        assert!(DeliveryFrequency::parse("hourly").is_none());
    }

    #[test]
    fn rupee_formatting() {
        assert_eq!(format_rupees(24_000), "₹240");
        assert_eq!(format_rupees(12_050), "₹120.50");
    }
}
