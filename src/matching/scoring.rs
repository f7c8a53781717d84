//! Five independent sub-scores for one candidate.
//!
//! | criterion    | max |
//! |--------------|-----|
//! | destination  | 40  |
//! | dates        | 25  |
//! | budget       | 20  |
//! | travelers    | 10  |
//! | requirements | 5   |

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{Duration, NaiveDate};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::types::{Criterion, MatchCriteria, ScoreBreakdown};
use crate::inventory::InventoryItem;
use crate::pipeline::types::{DateRange, Requirements};

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").unwrap());

/// Candidates starting this soon after the requested trip still earn partial date credit.
const NEAR_MISS_DAYS: i64 = 30;

pub fn score(criteria: &MatchCriteria, item: &InventoryItem) -> ScoreBreakdown {
    ScoreBreakdown {
        destination: destination_score(criteria.destination.as_deref(), item),
        dates: dates_score(criteria.dates.as_ref(), item),
        budget: budget_score(criteria.budget, item.price),
        travelers: travelers_score(criteria.travelers, item.min_pax, item.max_pax),
        requirements: requirements_score(&criteria.requirements, item),
    }
}

// ── Destination (40) ────────────────────────────────────────────────

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn words(s: &str) -> HashSet<String> {
    WORD.find_iter(&s.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| w.chars().count() >= 3)
        .collect()
}

pub fn destination_score(requested: Option<&str>, item: &InventoryItem) -> u8 {
    let Some(requested) = requested.map(normalize).filter(|r| !r.is_empty()) else {
        return 0;
    };
    let destination = normalize(&item.destination);

    if destination == requested {
        return 40;
    }
    if destination.contains(&requested) || (!destination.is_empty() && requested.contains(&destination)) {
        return 38;
    }

    let matches_field = |field: &Option<String>| {
        field
            .as_deref()
            .map(normalize)
            .filter(|f| !f.is_empty())
            .is_some_and(|f| f == requested || requested.contains(&f) || f.contains(&requested))
    };
    if matches_field(&item.country) {
        return 36;
    }
    if matches_field(&item.region) {
        return 35;
    }

    let wanted = words(&requested);
    if !wanted.is_empty() {
        let mut place_words = words(&destination);
        for field in [&item.country, &item.region].into_iter().flatten() {
            place_words.extend(words(field));
        }
        let overlap = wanted.intersection(&place_words).count();
        if overlap > 0 {
            let fraction = overlap as f64 / wanted.len() as f64;
            return 25 + (10.0 * fraction).round() as u8;
        }
    }

    if normalize(&item.title).contains(&requested) {
        return 20;
    }
    let mentioned = item
        .highlights
        .iter()
        .chain(item.activities.iter())
        .any(|text| normalize(text).contains(&requested));
    if mentioned {
        return 18;
    }
    0
}

// ── Dates (25) ──────────────────────────────────────────────────────

pub fn dates_score(requested: Option<&DateRange>, item: &InventoryItem) -> u8 {
    let Some(requested) = requested else {
        return 15;
    };
    if item.valid_from.is_none() && item.valid_to.is_none() {
        return if item.year_round { 20 } else { 15 };
    }

    let from = item.valid_from.unwrap_or(NaiveDate::MIN);
    let to = item.valid_to.unwrap_or(NaiveDate::MAX);
    let (start, end) = (requested.start, requested.last_day().max(requested.start));

    if start >= from && end <= to {
        25
    } else if start <= to && end >= from {
        20
    } else if from > end && from - end <= Duration::days(NEAR_MISS_DAYS) {
        15
    } else {
        0
    }
}

// ── Budget (20) ─────────────────────────────────────────────────────

pub fn budget_score(budget: Option<Decimal>, price: Option<Decimal>) -> u8 {
    let (Some(budget), Some(price)) = (budget, price) else {
        return 15;
    };
    if budget <= Decimal::ZERO {
        return 15;
    }

    let Some(deviation) = price
        .checked_sub(budget)
        .and_then(|diff| diff.checked_div(budget))
        .map(|d| d.abs())
    else {
        return if price > budget { 5 } else { 12 };
    };
    if deviation <= dec!(0.05) {
        20
    } else if deviation <= dec!(0.10) {
        18
    } else if deviation <= dec!(0.20) {
        15
    } else if deviation <= dec!(0.30) {
        10
    } else if price > budget {
        5
    } else {
        12
    }
}

// ── Travelers (10) ──────────────────────────────────────────────────

pub fn travelers_score(party: Option<u32>, min_pax: Option<u32>, max_pax: Option<u32>) -> u8 {
    let Some(party) = party else {
        return 8;
    };
    let min = min_pax.unwrap_or(1);
    let max = max_pax.unwrap_or(u32::MAX);

    if party > max {
        2
    } else if party >= min {
        10
    } else if min - party <= 2 {
        7
    } else {
        3
    }
}

// ── Requirements (5) ────────────────────────────────────────────────

fn loosely_equal(wanted: &Option<String>, offered: &Option<String>) -> bool {
    match (wanted.as_deref().map(normalize), offered.as_deref().map(normalize)) {
        (Some(w), Some(o)) if !w.is_empty() && !o.is_empty() => w.contains(&o) || o.contains(&w),
        _ => false,
    }
}

pub fn requirements_score(wanted: &Requirements, item: &InventoryItem) -> u8 {
    let mut score = 0u8;
    if loosely_equal(&wanted.package_type, &item.package_type) {
        score += 2;
    }
    if loosely_equal(&wanted.meal_plan, &item.meal_plan) {
        score += 2;
    }
    if let (Some(min), Some(rating)) = (wanted.accommodation_rating, item.accommodation_rating) {
        if rating >= min {
            score += 1;
        }
    }
    score.min(5)
}

// ── Explanations ────────────────────────────────────────────────────

/// Human-readable strong points (≥70% of a criterion's max), best first.
pub fn reasons(scores: &ScoreBreakdown, criteria: &MatchCriteria, item: &InventoryItem) -> Vec<String> {
    let mut strong: Vec<_> = scores
        .criteria()
        .into_iter()
        .filter(|(_, score, max)| *score > 0 && u32::from(*score) * 10 >= u32::from(*max) * 7)
        .collect();
    strong.sort_by(|a, b| b.1.cmp(&a.1));
    strong
        .into_iter()
        .map(|(criterion, _, _)| describe_strength(criterion, criteria, item))
        .collect()
}

/// Human-readable weak points (<50% of a criterion's max), in table order.
pub fn gaps(scores: &ScoreBreakdown, criteria: &MatchCriteria, item: &InventoryItem) -> Vec<String> {
    scores
        .criteria()
        .into_iter()
        .filter(|(_, score, max)| u32::from(*score) * 2 < u32::from(*max))
        .map(|(criterion, _, _)| describe_gap(criterion, criteria, item))
        .collect()
}

fn describe_strength(criterion: Criterion, criteria: &MatchCriteria, item: &InventoryItem) -> String {
    match criterion {
        Criterion::Destination => format!("Destination matches: {}", item.destination),
        Criterion::Dates => "Available for the requested dates".to_string(),
        Criterion::Budget => match item.price {
            Some(price) => format!("Price {price} fits the budget"),
            None => "Within budget".to_string(),
        },
        Criterion::Travelers => match criteria.travelers {
            Some(n) => format!("Suitable for a party of {n}"),
            None => "Suitable group size".to_string(),
        },
        Criterion::Requirements => "Matches the requested package style".to_string(),
    }
}

fn describe_gap(criterion: Criterion, criteria: &MatchCriteria, item: &InventoryItem) -> String {
    match criterion {
        Criterion::Destination => format!("Destination differs: {}", item.destination),
        Criterion::Dates => "Not available for the requested dates".to_string(),
        Criterion::Budget => match (item.price, criteria.budget) {
            (Some(price), Some(budget)) if price > budget => {
                format!("Price {price} is above the budget of {budget}")
            }
            _ => "Price is well below the stated budget".to_string(),
        },
        Criterion::Travelers => "Group size outside the supported range".to_string(),
        Criterion::Requirements => "Package style or meal plan not matched".to_string(),
    }
}
