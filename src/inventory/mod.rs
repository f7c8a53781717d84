//! Inventory: the published itinerary catalog and the verified supplier-offer cache.
//!
//! Both are read concurrently by matching and only ever appended to, so no
//! locking beyond the database's own is needed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::SupplierOffer;
use crate::store::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Catalog,
    VerifiedSupplier,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::VerifiedSupplier => "verified_supplier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "catalog" => Some(Self::Catalog),
            "verified_supplier" => Some(Self::VerifiedSupplier),
            _ => None,
        }
    }
}

/// A catalog itinerary or supplier offer, normalized to one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    pub tenant_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub destination: String,
    pub country: Option<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub activities: Vec<String>,
    /// Package price for the party.
    pub price: Option<Decimal>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    #[serde(default)]
    pub year_round: bool,
    pub min_pax: Option<u32>,
    pub max_pax: Option<u32>,
    pub package_type: Option<String>,
    pub meal_plan: Option<String>,
    pub accommodation_rating: Option<u8>,
    /// Supplier name or message that contributed this offer.
    pub supplier: Option<String>,
}

impl InventoryItem {
    /// Minimal catalog entry; fill the rest with struct update syntax.
    pub fn catalog(tenant_id: &str, title: &str, destination: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            source_type: SourceType::Catalog,
            title: title.to_string(),
            destination: destination.to_string(),
            country: None,
            region: None,
            highlights: Vec::new(),
            activities: Vec::new(),
            price: None,
            valid_from: None,
            valid_to: None,
            year_round: false,
            min_pax: None,
            max_pax: None,
            package_type: None,
            meal_plan: None,
            accommodation_rating: None,
            supplier: None,
        }
    }

    pub fn from_supplier_offer(tenant_id: &str, supplier: &str, offer: &SupplierOffer) -> Self {
        Self {
            source_type: SourceType::VerifiedSupplier,
            country: offer.country.clone(),
            highlights: offer.highlights.clone(),
            price: offer.price,
            valid_from: offer.valid_from,
            valid_to: offer.valid_to,
            min_pax: offer.min_pax,
            max_pax: offer.max_pax,
            package_type: offer.package_type.clone(),
            meal_plan: offer.meal_plan.clone(),
            supplier: Some(supplier.to_string()),
            ..Self::catalog(tenant_id, &offer.title, &offer.destination)
        }
    }

    /// Case-insensitive (title, destination) identity used for deduplication.
    pub fn dedup_key(&self) -> (String, String) {
        (
            self.title.trim().to_lowercase(),
            self.destination.trim().to_lowercase(),
        )
    }
}

/// Read/append access to inventory, per tenant.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn verified_offers(&self, tenant_id: &str) -> Result<Vec<InventoryItem>, DatabaseError>;

    async fn published_itineraries(&self, tenant_id: &str)
    -> Result<Vec<InventoryItem>, DatabaseError>;

    /// Append offers from a supplier message. Existing entries are never updated.
    async fn record_supplier_offers(
        &self,
        tenant_id: &str,
        supplier: &str,
        offers: &[SupplierOffer],
    ) -> Result<usize, DatabaseError>;
}

/// `InventorySource` over the main database.
pub struct DbInventory {
    db: Arc<dyn Database>,
}

impl DbInventory {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn publish_itinerary(&self, item: &InventoryItem) -> Result<(), DatabaseError> {
        self.db.insert_inventory_item(item).await
    }
}

#[async_trait]
impl InventorySource for DbInventory {
    async fn verified_offers(&self, tenant_id: &str) -> Result<Vec<InventoryItem>, DatabaseError> {
        self.db
            .list_inventory(tenant_id, SourceType::VerifiedSupplier)
            .await
    }

    async fn published_itineraries(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<InventoryItem>, DatabaseError> {
        self.db.list_inventory(tenant_id, SourceType::Catalog).await
    }

    async fn record_supplier_offers(
        &self,
        tenant_id: &str,
        supplier: &str,
        offers: &[SupplierOffer],
    ) -> Result<usize, DatabaseError> {
        let mut count = 0;
        for offer in offers.iter().filter(|o| !o.title.trim().is_empty()) {
            let item = InventoryItem::from_supplier_offer(tenant_id, supplier, offer);
            self.db.insert_inventory_item(&item).await?;
            count += 1;
        }
        info!(tenant_id, supplier, count, "Recorded supplier offers");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::store::LibSqlBackend;

    fn offer(title: &str) -> SupplierOffer {
        SupplierOffer {
            title: title.to_string(),
            destination: "Santorini".to_string(),
            country: Some("Greece".to_string()),
            price: Some(dec!(3200)),
            valid_from: None,
            valid_to: None,
            min_pax: Some(2),
            max_pax: Some(4),
            package_type: Some("honeymoon".to_string()),
            meal_plan: None,
            highlights: vec!["Sunset cruise".to_string()],
        }
    }

    #[test]
    fn dedup_key_ignores_case_and_padding() {
        let a = InventoryItem::catalog("t", "Paris Getaway", "Paris, France");
        let b = InventoryItem::catalog("t", "  paris getaway", "PARIS, FRANCE ");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[tokio::test]
    async fn supplier_offers_are_appended() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let inventory = DbInventory::new(Arc::clone(&db));

        let n = inventory
            .record_supplier_offers("acme", "Aegean DMC", &[offer("Island Escape"), offer("")])
            .await
            .unwrap();
        assert_eq!(n, 1);
        inventory
            .record_supplier_offers("acme", "Aegean DMC", &[offer("Island Escape")])
            .await
            .unwrap();

        let offers = inventory.verified_offers("acme").await.unwrap();
        assert_eq!(offers.len(), 2);
        assert!(offers.iter().all(|o| o.source_type == SourceType::VerifiedSupplier));
        assert_eq!(offers[0].supplier.as_deref(), Some("Aegean DMC"));

        assert!(inventory.verified_offers("globex").await.unwrap().is_empty());
        assert!(inventory.published_itineraries("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn catalog_is_separate_from_offers() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let inventory = DbInventory::new(db);
        inventory
            .publish_itinerary(&InventoryItem {
                price: Some(dec!(4900)),
                ..InventoryItem::catalog("acme", "Paris Classic", "Paris, France")
            })
            .await
            .unwrap();

        let catalog = inventory.published_itineraries("acme").await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].price, Some(dec!(4900)));
        assert!(inventory.verified_offers("acme").await.unwrap().is_empty());
    }
}
