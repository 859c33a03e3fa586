//! Parsers for typed and tapped answers.

use chrono::{Duration, NaiveDate};

use crate::domain::fish::{FISH_TYPES, fish_type};
use crate::domain::{DeliveryFrequency, FishTypeFilter, FishTypeId, GeoPoint, IncomingMessage};

/// Selection id of confirmation buttons.
pub const CONFIRM_YES: &str = "confirm:yes";
/// Selection id of "change my answers" buttons.
pub const CONFIRM_EDIT: &str = "confirm:edit";

/// `true` for a confirm tap or a typed yes.
#[must_use]
pub fn is_affirmative(choice: &str) -> bool {
    choice == CONFIRM_YES
        || matches!(
            choice.trim().to_lowercase().as_str(),
            "yes" | "y" | "ok" | "okay" | "confirm" | "sure"
        )
}

/// Strips `prefix` from a selection id.
#[must_use]
pub fn selected<'a>(choice: &'a str, prefix: &str) -> Option<&'a str> {
    choice.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

/// Parses a positive amount, tolerating currency and unit decorations
/// (`"₹ 1,200"`, `"15 kg"`, `"5km"`).
#[must_use]
pub fn parse_number(text: &str) -> Option<f64> {
    let lowered = text.trim().to_lowercase();
    let cleaned: String = lowered
        .trim_start_matches('₹')
        .trim_start_matches("rs.")
        .trim_start_matches("rs")
        .trim_end_matches("/kg")
        .trim_end_matches("kgs")
        .trim_end_matches("kg")
        .trim_end_matches("km")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Largest accepted amount: ten crore rupees.
const MAX_PAISE: f64 = 1_000_000_000.0;

/// Parses a rupee amount into paise.
#[must_use]
pub fn parse_rupees(text: &str) -> Option<i64> {
    let paise = (parse_number(text)? * 100.0).round();
    if paise < 1.0 || paise > MAX_PAISE {
        return None;
    }
    // Bounded above, so the cast is exact.
    Some(paise as i64)
}

/// Normalizes a typed phone number to digits with country code. Ten-digit
/// numbers are assumed to be Indian mobiles.
#[must_use]
pub fn parse_phone(text: &str) -> Option<String> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    let stray = text
        .chars()
        .any(|c| !(c.is_ascii_digit() || c.is_whitespace() || matches!(c, '+' | '-' | '(' | ')')));
    if stray {
        return None;
    }
    let digits = digits.trim_start_matches('0');
    match digits.len() {
        10 => Some(format!("91{digits}")),
        11..=15 => Some(digits.to_string()),
        _ => None,
    }
}

/// Parses a due date relative to `today`.
#[must_use]
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = text.trim().to_lowercase();
    match text.as_str() {
        "today" => return Some(today),
        "tomorrow" => return today.checked_add_signed(Duration::days(1)),
        _ => {}
    }
    ["%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&text, fmt).ok())
}

/// A shared pin, or coordinates typed as `lat,lon`.
#[must_use]
pub fn location_of(message: &IncomingMessage) -> Option<GeoPoint> {
    message
        .location
        .or_else(|| message.trimmed_text().and_then(GeoPoint::parse_pair))
}

/// Resolves one species from a `fish:<id>` tap, a catalog number or a name.
#[must_use]
pub fn parse_fish_type(choice: &str) -> Option<FishTypeId> {
    let token = selected(choice, "fish:").unwrap_or(choice).trim();
    if let Ok(n) = token.parse::<i32>() {
        return fish_type(FishTypeId(n)).map(|t| t.id);
    }
    let lowered = token.to_lowercase();
    FISH_TYPES
        .iter()
        .find(|t| t.name.to_lowercase() == lowered || t.local_name.to_lowercase() == lowered)
        .map(|t| t.id)
}

/// Resolves a species filter: `fish:all`/`all`, one species, or a comma
/// separated list.
#[must_use]
pub fn parse_fish_filter(choice: &str) -> Option<FishTypeFilter> {
    let token = selected(choice, "fish:").unwrap_or(choice).trim();
    if token.eq_ignore_ascii_case("all") {
        return Some(FishTypeFilter::All);
    }
    let ids: Option<Vec<FishTypeId>> = token.split(',').map(parse_fish_type).collect();
    FishTypeFilter::only(ids?).ok()
}

/// Resolves a delivery frequency from a `freq:<id>` tap, its label or its
/// menu position.
#[must_use]
pub fn parse_frequency(choice: &str) -> Option<DeliveryFrequency> {
    let token = selected(choice, "freq:").unwrap_or(choice).trim();
    if let Some(f) = DeliveryFrequency::parse(token) {
        return Some(f);
    }
    if let Ok(n) = token.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| DeliveryFrequency::ALL.get(i).copied());
    }
    DeliveryFrequency::ALL
        .into_iter()
        .find(|f| f.label().eq_ignore_ascii_case(token))
}

/// A 1-based position typed against a list of `len` entries.
#[must_use]
pub fn parse_index(choice: &str, len: usize) -> Option<usize> {
    let n: usize = choice.trim().parse().ok()?;
    (1..=len).contains(&n).then(|| n.saturating_sub(1))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn numbers_tolerate_decorations() {
        assert_eq!(parse_number("₹ 1,200"), Some(1200.0));
        assert_eq!(parse_number("15 kg"), Some(15.0));
        assert_eq!(parse_number("5km"), Some(5.0));
        assert_eq!(parse_number("Rs. 180/kg"), Some(180.0));
        assert_eq!(parse_number("-3"), None);
        assert_eq!(parse_number("lots"), None);
    }

    #[test]
    fn rupees_become_paise() {
        assert_eq!(parse_rupees("180"), Some(18_000));
        assert_eq!(parse_rupees("99.5"), Some(9_950));
        assert_eq!(parse_rupees("0"), None);
        assert_eq!(parse_rupees("100000000000"), None);
    }

    #[test]
    fn phones_normalize_to_country_code() {
        assert_eq!(parse_phone("98470 12345"), Some("919847012345".to_string()));
        assert_eq!(parse_phone("+91 98470-12345"), Some("919847012345".to_string()));
        assert_eq!(parse_phone("12345"), None);
        assert_eq!(parse_phone("call me"), None);
    }

    #[test]
    fn dates_accept_common_formats() {
        let Some(today) = NaiveDate::from_ymd_opt(2026, 3, 1) else {
            panic!("valid literal date");
        };
        assert_eq!(parse_date("15-03-2026", today), NaiveDate::from_ymd_opt(2026, 3, 15));
        assert_eq!(parse_date("2026-03-20", today), NaiveDate::from_ymd_opt(2026, 3, 20));
        assert_eq!(parse_date("Tomorrow", today), NaiveDate::from_ymd_opt(2026, 3, 2));
        assert_eq!(parse_date("soon", today), None);
    }

    #[test]
    fn fish_choices_resolve_by_id_number_or_name() {
        assert_eq!(parse_fish_type("fish:4"), Some(FishTypeId(4)));
        assert_eq!(parse_fish_type("2"), Some(FishTypeId(2)));
        assert_eq!(parse_fish_type("mathi"), Some(FishTypeId(1)));
        assert_eq!(parse_fish_type("whale"), None);
        assert_eq!(parse_fish_filter("fish:all"), Some(FishTypeFilter::All));
        assert!(matches!(parse_fish_filter("1, 2"), Some(FishTypeFilter::Only(ids)) if ids.len() == 2));
        assert_eq!(parse_fish_filter("1,whale"), None);
    }

    #[test]
    fn frequency_resolves_by_id_label_or_position() {
        assert_eq!(parse_frequency("freq:twice_daily"), Some(DeliveryFrequency::TwiceDaily));
        assert_eq!(parse_frequency("Mornings only"), Some(DeliveryFrequency::MorningOnly));
        assert_eq!(parse_frequency("4"), Some(DeliveryFrequency::WeeklyDigest));
        assert_eq!(parse_frequency("5"), None);
    }

    #[test]
    fn index_is_one_based_and_bounded() {
        assert_eq!(parse_index("1", 3), Some(0));
        assert_eq!(parse_index("3", 3), Some(2));
        assert_eq!(parse_index("0", 3), None);
        assert_eq!(parse_index("4", 3), None);
    }
}
