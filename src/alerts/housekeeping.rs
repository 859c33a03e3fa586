//! Periodic clean-up jobs: catch expiry and agreement reminders.

use chrono::{DateTime, Days, NaiveDate, Utc};

use super::engine::AlertEngine;
use crate::dispatch::{Delivery, Lane};
use crate::domain::fish::format_rupees;
use crate::domain::{Agreement, AgreementDirection};
use crate::messaging::OutboundMessage;
use crate::persistence::StoreError;

impl AlertEngine {
    /// Marks every open catch past its listing window as expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn expire_catches(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = self.stores.catches.expire_catches(now).await?;
        if expired > 0 {
            tracing::info!(expired, "expired stale catches");
        }
        Ok(expired)
    }

    /// Reminds both parties of accepted agreements due within
    /// `reminder_days` of `today`. Each agreement is reminded once.
    ///
    /// Returns the number of agreements reminded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn send_agreement_reminders(
        &self,
        today: NaiveDate,
        reminder_days: u32,
    ) -> Result<usize, StoreError> {
        let until = today
            .checked_add_days(Days::new(u64::from(reminder_days)))
            .unwrap_or(NaiveDate::MAX);
        let due = self.stores.agreements.agreements_due(until).await?;
        let mut reminded = 0usize;
        for agreement in due {
            let mut delivered = false;
            for message in reminder_messages(&agreement, today) {
                if !matches!(self.outbound.deliver(message, Lane::Broadcast).await, Delivery::Failed(_)) {
                    delivered = true;
                }
            }
            // Retry on the next sweep if neither side could be reached.
            if delivered {
                self.stores.agreements.mark_reminded(agreement.id, Utc::now()).await?;
                reminded = reminded.saturating_add(1);
            } else {
                tracing::warn!(agreement_id = %agreement.id, "agreement reminder not delivered");
            }
        }
        if reminded > 0 {
            tracing::info!(reminded, "agreement reminders sent");
        }
        Ok(reminded)
    }
}

fn when(due: NaiveDate, today: NaiveDate) -> String {
    match (due - today).num_days() {
        d if d < 0 => format!("was due on {}", due.format("%d %b")),
        0 => "is due today".to_string(),
        1 => "is due tomorrow".to_string(),
        d => format!("is due in {d} days ({})", due.format("%d %b")),
    }
}

fn reminder_messages(agreement: &Agreement, today: NaiveDate) -> [OutboundMessage; 2] {
    let amount = format_rupees(agreement.amount);
    let when = when(agreement.due_date, today);
    let (lender, borrower) = match agreement.direction {
        AgreementDirection::Lent => (&agreement.creator_phone, &agreement.counterparty_phone),
        AgreementDirection::Borrowed => (&agreement.counterparty_phone, &agreement.creator_phone),
    };
    [
        OutboundMessage::text(
            lender,
            format!(
                "⏰ Reminder: {amount} you lent to +{borrower} for \"{}\" {when}.",
                agreement.purpose
            ),
        ),
        OutboundMessage::text(
            borrower,
            format!(
                "⏰ Reminder: {amount} you borrowed from +{lender} for \"{}\" {when}.",
                agreement.purpose
            ),
        ),
    ]
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::alerts::engine::tests::{fixture, point, post_catch};
    use crate::domain::{AgreementId, AgreementStatus, CatchStatus};
    use crate::flow::testing::body_text;
    use crate::persistence::{AgreementStore, CatchStore};
    use chrono::Duration;

    fn agreement(status: AgreementStatus, due: NaiveDate) -> Agreement {
        Agreement {
            id: AgreementId::new(),
            creator_phone: "919800000001".to_string(),
            counterparty_phone: "919800000002".to_string(),
            direction: AgreementDirection::Borrowed,
            amount: 500_000,
            purpose: "boat repair".to_string(),
            due_date: due,
            status,
            reminded_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn expiry_closes_catches_past_their_window() {
        let f = fixture();
        let first = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let second = post_catch(&f, "9501", 1, Some(point(9.95, 76.25))).await;
        let Ok(n) = f.engine.expire_catches(second.expires_at + Duration::seconds(1)).await else {
            panic!("expiry failed");
        };
        assert_eq!(n, 2);
        let Ok(Some(c)) = f.store.catch_by_id(first.id).await else {
            panic!("catch missing");
        };
        assert_eq!(c.status, CatchStatus::Expired);

        let Ok(again) = f.engine.expire_catches(Utc::now() + Duration::days(2)).await else {
            panic!("expiry failed");
        };
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn expiry_leaves_open_window_alone() {
        let f = fixture();
        let c = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let Ok(n) = f.engine.expire_catches(Utc::now()).await else {
            panic!("expiry failed");
        };
        assert_eq!(n, 0);
        let Ok(Some(c)) = f.store.catch_by_id(c.id).await else {
            panic!("catch missing");
        };
        assert_eq!(c.status, CatchStatus::Available);
    }

    #[tokio::test]
    async fn reminders_reach_both_parties_once() {
        let f = fixture();
        let Some(today) = NaiveDate::from_ymd_opt(2026, 3, 10) else {
            panic!("valid date");
        };
        let Some(soon) = NaiveDate::from_ymd_opt(2026, 3, 11) else {
            panic!("valid date");
        };
        let Some(later) = NaiveDate::from_ymd_opt(2026, 3, 30) else {
            panic!("valid date");
        };
        let due = agreement(AgreementStatus::Accepted, soon);
        let pending = agreement(AgreementStatus::Pending, soon);
        let far = agreement(AgreementStatus::Accepted, later);
        for a in [&due, &pending, &far] {
            let Ok(()) = f.store.insert_agreement(a).await else {
                panic!("insert agreement");
            };
        }

        let Ok(n) = f.engine.send_agreement_reminders(today, 1).await else {
            panic!("reminders failed");
        };
        assert_eq!(n, 1);

        let Some(to_lender) = f.messenger.sent_to("919800000002").pop() else {
            panic!("lender should be reminded");
        };
        let text = body_text(&to_lender.body);
        assert!(text.contains("you lent") && text.contains("due tomorrow"), "{text}");
        let Some(to_borrower) = f.messenger.sent_to("919800000001").pop() else {
            panic!("borrower should be reminded");
        };
        assert!(body_text(&to_borrower.body).contains("you borrowed"));

        let Ok(again) = f.engine.send_agreement_reminders(today, 1).await else {
            panic!("reminders failed");
        };
        assert_eq!(again, 0);
        assert_eq!(f.messenger.sent().len(), 2);

        let Ok(Some(stored)) = f.store.agreement_by_id(due.id).await else {
            panic!("agreement missing");
        };
        assert!(stored.reminded_at.is_some());
    }

    #[test]
    fn due_phrase_covers_past_and_future() {
        let Some(today) = NaiveDate::from_ymd_opt(2026, 3, 10) else {
            panic!("valid date");
        };
        assert_eq!(when(today, today), "is due today");
        let Some(past) = NaiveDate::from_ymd_opt(2026, 3, 8) else {
            panic!("valid date");
        };
        assert!(when(past, today).starts_with("was due on"));
        let Some(ahead) = NaiveDate::from_ymd_opt(2026, 3, 13) else {
            panic!("valid date");
        };
        assert_eq!(when(ahead, today), "is due in 3 days (13 Mar)");
    }
}
