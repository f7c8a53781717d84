//! Matching inputs and outputs.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::inventory::{InventoryItem, SourceType};
use crate::pipeline::types::{DateRange, ExtractedData, Requirements};

/// What the customer asked for, reduced to the fields scoring looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchCriteria {
    pub destination: Option<String>,
    pub dates: Option<DateRange>,
    /// Whole-party budget.
    pub budget: Option<Decimal>,
    pub travelers: Option<u32>,
    pub requirements: Requirements,
}

impl MatchCriteria {
    pub fn from_extracted(data: &ExtractedData) -> Self {
        Self {
            destination: data
                .destination
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            dates: data.travel_dates,
            budget: data.total_budget().filter(|b| *b > Decimal::ZERO),
            travelers: data.travelers.map(|t| t.total()).filter(|n| *n > 0),
            requirements: data.requirements.clone(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_budget(mut self, budget: Decimal) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_travelers(mut self, travelers: u32) -> Self {
        self.travelers = Some(travelers);
        self
    }

    pub fn with_dates(mut self, start: NaiveDate, end: Option<NaiveDate>) -> Self {
        self.dates = Some(DateRange { start, end });
        self
    }
}

/// Per-criterion maxima.
pub const DESTINATION_MAX: u8 = 40;
pub const DATES_MAX: u8 = 25;
pub const BUDGET_MAX: u8 = 20;
pub const TRAVELERS_MAX: u8 = 10;
pub const REQUIREMENTS_MAX: u8 = 5;

/// The five sub-scores. Each is bounded by its `*_MAX`; the sum is at most 100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub destination: u8,
    pub dates: u8,
    pub budget: u8,
    pub travelers: u8,
    pub requirements: u8,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u8 {
        self.destination + self.dates + self.budget + self.travelers + self.requirements
    }

    /// `(label, score, max)` for each criterion, in table order.
    pub fn criteria(&self) -> [(Criterion, u8, u8); 5] {
        [
            (Criterion::Destination, self.destination, DESTINATION_MAX),
            (Criterion::Dates, self.dates, DATES_MAX),
            (Criterion::Budget, self.budget, BUDGET_MAX),
            (Criterion::Travelers, self.travelers, TRAVELERS_MAX),
            (Criterion::Requirements, self.requirements, REQUIREMENTS_MAX),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    Destination,
    Dates,
    Budget,
    Travelers,
    Requirements,
}

/// One scored inventory item.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub item: InventoryItem,
    pub scores: ScoreBreakdown,
    pub total: u8,
    pub reasons: Vec<String>,
    pub gaps: Vec<String>,
}

impl MatchCandidate {
    pub fn summary(&self) -> MatchSummary {
        MatchSummary {
            item_id: self.item.id.clone(),
            title: self.item.title.clone(),
            destination: self.item.destination.clone(),
            source_type: self.item.source_type,
            price: self.item.price,
            total: self.total,
            scores: self.scores,
            reasons: self.reasons.clone(),
            gaps: self.gaps.clone(),
        }
    }
}

/// What gets persisted on the message for a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSummary {
    pub item_id: String,
    pub title: String,
    pub destination: String,
    pub source_type: SourceType,
    pub price: Option<Decimal>,
    pub total: u8,
    #[serde(default)]
    pub scores: ScoreBreakdown,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
}
