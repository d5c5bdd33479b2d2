//! Core inventory model and provenance types for invsync.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Catalog category as reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Product,
    Service,
    #[serde(other)]
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "PRODUCT",
            Self::Service => "SERVICE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// `Product` or `Service`; `Unknown` says nothing about the item.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reusable product/service definition referenced by a line item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
}

/// Raw line item from a job or quote, read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default, alias = "linkedProductOrService")]
    pub linked_catalog_entry: Option<CatalogEntry>,
}

/// Which upstream collection a record came from. Observations from the two
/// kinds are never aggregated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Jobs,
    Quotes,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Quotes => "quotes",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field a resolved value was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldOrigin {
    LineItemName,
    LineItemDescription,
    LineItemCategory,
    LinkedName,
    LinkedDescription,
    LinkedCategory,
    CatalogImport,
}

impl FieldOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LineItemName => "lineItem.name",
            Self::LineItemDescription => "lineItem.description",
            Self::LineItemCategory => "lineItem.category",
            Self::LinkedName => "linkedCatalogEntry.name",
            Self::LinkedDescription => "linkedCatalogEntry.description",
            Self::LinkedCategory => "linkedCatalogEntry.category",
            Self::CatalogImport => "catalogImport.row",
        }
    }
}

impl fmt::Display for FieldOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldOrigin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Ordered, duplicate-free list of field origins. Diagnostic metadata only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Provenance(Vec<FieldOrigin>);

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, origin: FieldOrigin) {
        if !self.0.contains(&origin) {
            self.0.push(origin);
        }
    }

    pub fn with(mut self, origin: FieldOrigin) -> Self {
        self.record(origin);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = FieldOrigin> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, origin: FieldOrigin) -> bool {
        self.0.contains(&origin)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(FieldOrigin::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&joined)
    }
}

/// Canonical inventory reading of a single line item.
///
/// `category` is `Product` when an explicit category said so and `Unknown`
/// when the item was accepted heuristically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryObservation {
    pub name: String,
    pub sku: Option<String>,
    pub description: Option<String>,
    pub category: Category,
    pub provenance: Provenance,
}

impl InventoryObservation {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.name, self.sku.as_deref())
    }

    pub fn has_sku(&self) -> bool {
        self.sku.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// Deduplication key shared by aggregation, merging and the ledger.
///
/// An absent SKU and an empty SKU are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey {
    pub sku: String,
    pub name: String,
}

impl IdentityKey {
    pub fn new(name: &str, sku: Option<&str>) -> Self {
        Self {
            sku: normalize_sku(sku),
            name: name.to_string(),
        }
    }
}

pub fn normalize_sku(sku: Option<&str>) -> String {
    sku.map(str::trim).unwrap_or_default().to_string()
}

/// Per-source count for one identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedEntry {
    pub name: String,
    pub sku: String,
    pub description: Option<String>,
    pub count: usize,
}

impl AggregatedEntry {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.name, Some(&self.sku))
    }
}

/// One product in the combined inventory, with independent quote and job counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombinedEntry {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub quotes_count: usize,
    pub jobs_count: usize,
}

impl CombinedEntry {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.name, Some(&self.sku))
    }

    pub fn has_sku(&self) -> bool {
        !self.sku.is_empty()
    }

    pub fn total_allocated(&self) -> usize {
        self.quotes_count + self.jobs_count
    }

    /// Display order: SKU-bearing entries first by SKU, then the rest by name.
    /// Both comparisons ignore case; the exact strings break remaining ties.
    pub fn display_order(a: &Self, b: &Self) -> Ordering {
        match (a.has_sku(), b.has_sku()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (true, true) => a
                .sku
                .to_lowercase()
                .cmp(&b.sku.to_lowercase())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.identity_key().cmp(&b.identity_key())),
            (false, false) => a
                .name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name)),
        }
    }
}

/// Word lists consulted by the identity classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    /// Case-insensitive substrings marking a quote line item as a service.
    #[serde(default = "default_service_keywords")]
    pub service_keywords: Vec<String>,
    /// All-caps words that look like SKUs but are not.
    #[serde(default = "default_sku_stop_words")]
    pub sku_stop_words: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            service_keywords: default_service_keywords(),
            sku_stop_words: default_sku_stop_words(),
        }
    }
}

impl Vocabulary {
    pub fn mentions_service(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.service_keywords
            .iter()
            .any(|keyword| lower.contains(&keyword.to_lowercase()))
    }

    pub fn is_stop_word(&self, candidate: &str) -> bool {
        self.sku_stop_words.iter().any(|w| w == candidate)
    }
}

fn default_service_keywords() -> Vec<String> {
    [
        "installation",
        "labor",
        "service",
        "removal",
        "maintenance",
        "repair",
        "visit",
        "rental",
        "consultation",
        "delivery",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sku_stop_words() -> Vec<String> {
    [
        "AND", "THE", "FOR", "WITH", "FROM", "UNIT", "HAND", "WIDE", "LONG", "HIGH", "TALL",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sku: &str, name: &str) -> CombinedEntry {
        CombinedEntry {
            sku: sku.to_string(),
            name: name.to_string(),
            description: None,
            quotes_count: 1,
            jobs_count: 0,
        }
    }

    #[test]
    fn absent_and_empty_sku_share_a_key() {
        assert_eq!(IdentityKey::new("Widget", None), IdentityKey::new("Widget", Some("")));
        assert_eq!(IdentityKey::new("Widget", Some(" W1 ")), IdentityKey::new("Widget", Some("W1")));
        assert_ne!(IdentityKey::new("Widget", Some("W1")), IdentityKey::new("Widget", None));
    }

    #[test]
    fn provenance_keeps_first_insertion_order_without_duplicates() {
        let prov = Provenance::new()
            .with(FieldOrigin::LineItemCategory)
            .with(FieldOrigin::LineItemName)
            .with(FieldOrigin::LineItemCategory);
        assert_eq!(prov.to_string(), "lineItem.category, lineItem.name");
        assert_eq!(
            serde_json::to_value(&prov).unwrap(),
            serde_json::json!(["lineItem.category", "lineItem.name"])
        );
    }

    #[test]
    fn display_order_puts_skus_first_case_insensitively() {
        let mut entries = vec![
            entry("", "zebra mat"),
            entry("b200", "Ramp"),
            entry("", "Anchor kit"),
            entry("A100", "Rail"),
        ];
        entries.sort_by(CombinedEntry::display_order);
        let order = entries
            .iter()
            .map(|e| (e.sku.as_str(), e.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![("A100", "Rail"), ("b200", "Ramp"), ("", "Anchor kit"), ("", "zebra mat")]
        );
    }

    #[test]
    fn unknown_categories_deserialize_leniently() {
        let item: LineItemRecord = serde_json::from_value(serde_json::json!({
            "name": "Ramp",
            "category": "BUNDLE",
            "linkedProductOrService": { "name": "RAEZ1310", "category": "PRODUCT" }
        }))
        .unwrap();
        assert_eq!(item.category, Some(Category::Unknown));
        assert_eq!(
            item.linked_catalog_entry.and_then(|l| l.category),
            Some(Category::Product)
        );
    }

    #[test]
    fn service_keywords_match_substrings_ignoring_case() {
        let vocab = Vocabulary::default();
        assert!(vocab.mentions_service("Installation Labor"));
        assert!(vocab.mentions_service("Site VISIT fee"));
        assert!(!vocab.mentions_service("Rubber Threshold Ramp"));
    }
}
