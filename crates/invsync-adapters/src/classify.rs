//! Identity classification of raw line items.
//!
//! Each line item is resolved by a pure function: acceptance first (is this
//! a product at all?), then name/SKU/description resolution over the ordered
//! candidates `line item -> linked catalog entry`. The first candidate to
//! supply a field keeps it.

use invsync_core::{
    CatalogEntry, Category, FieldOrigin, InventoryObservation, LineItemRecord, Provenance,
    SourceKind, Vocabulary,
};

use crate::SourceRecord;

/// True when `candidate` is a bare product code: at least three characters
/// from `[A-Z0-9-]` that are not a stop-listed word.
pub fn is_name_sku(candidate: &str, vocab: &Vocabulary) -> bool {
    let candidate = candidate.trim();
    candidate.chars().count() >= 3
        && candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
        && !vocab.is_stop_word(candidate)
}

/// Remove standalone occurrences of `sku` (optionally wrapped in brackets or
/// followed by a separator) from a display name.
pub fn strip_sku_token(name: &str, sku: &str) -> String {
    let is_separator = |t: &str| t.chars().all(|c| matches!(c, '-' | ':' | '|' | ',' | ';' | '/'));
    let mut kept = name
        .split_whitespace()
        .filter(|token| {
            token.trim_matches(|c: char| matches!(c, '(' | ')' | '[' | ']' | ',' | ':' | ';'))
                != sku
        })
        .collect::<Vec<_>>();
    while kept.first().is_some_and(|t| is_separator(t)) {
        kept.remove(0);
    }
    while kept.last().is_some_and(|t| is_separator(t)) {
        kept.pop();
    }
    let stripped = kept.join(" ");
    if stripped.is_empty() {
        name.trim().to_string()
    } else {
        stripped
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn linked(item: &LineItemRecord) -> Option<&CatalogEntry> {
    item.linked_catalog_entry.as_ref()
}

/// Jobs always expose categories, so only an explicit PRODUCT is accepted.
fn job_acceptance(item: &LineItemRecord) -> Option<(Category, Provenance)> {
    let mut provenance = Provenance::new();
    if item.category == Some(Category::Product) {
        provenance.record(FieldOrigin::LineItemCategory);
    }
    if linked(item).and_then(|l| l.category) == Some(Category::Product) {
        provenance.record(FieldOrigin::LinkedCategory);
    }
    (!provenance.is_empty()).then_some((Category::Product, provenance))
}

/// Quotes rarely carry a category: an explicit PRODUCT wins, an explicit
/// SERVICE rejects, and otherwise the name is screened for service keywords.
fn quote_acceptance(item: &LineItemRecord, vocab: &Vocabulary) -> Option<(Category, Provenance)> {
    let direct = item.category.filter(Category::is_conclusive);
    let via_link = linked(item)
        .and_then(|l| l.category)
        .filter(Category::is_conclusive);

    let mut provenance = Provenance::new();
    if direct == Some(Category::Product) {
        provenance.record(FieldOrigin::LineItemCategory);
    }
    if via_link == Some(Category::Product) {
        provenance.record(FieldOrigin::LinkedCategory);
    }
    if !provenance.is_empty() {
        return Some((Category::Product, provenance));
    }
    if direct.is_some() || via_link.is_some() {
        return None;
    }

    let screened = non_empty(&item.name).or_else(|| linked(item).and_then(|l| non_empty(&l.name)))?;
    if vocab.mentions_service(screened) {
        return None;
    }
    Some((Category::Unknown, provenance))
}

fn resolve_identity(
    item: &LineItemRecord,
    vocab: &Vocabulary,
    category: Category,
    mut provenance: Provenance,
) -> Option<InventoryObservation> {
    let link = linked(item);

    let description = match (non_empty(&item.description), link.and_then(|l| non_empty(&l.description))) {
        (Some(d), _) => {
            provenance.record(FieldOrigin::LineItemDescription);
            Some(d)
        }
        (None, Some(d)) => {
            provenance.record(FieldOrigin::LinkedDescription);
            Some(d)
        }
        (None, None) => None,
    };

    let candidates = [
        (non_empty(&item.name), FieldOrigin::LineItemName),
        (link.and_then(|l| non_empty(&l.name)), FieldOrigin::LinkedName),
    ];

    let mut name: Option<String> = None;
    let mut sku: Option<String> = None;
    for (candidate, origin) in candidates {
        let Some(candidate) = candidate else {
            continue;
        };
        if name.as_deref() == Some(candidate) || sku.as_deref() == Some(candidate) {
            continue;
        }
        provenance.record(origin);

        if is_name_sku(candidate, vocab) {
            if sku.is_some() {
                continue;
            }
            sku = Some(candidate.to_string());
            // A description outranks any plain name picked up earlier.
            match description {
                Some(d) => name = Some(strip_sku_token(d, candidate)),
                None if name.is_none() => name = Some(candidate.to_string()),
                None => {}
            }
        } else if name.is_none() {
            name = Some(candidate.to_string());
        }
    }

    Some(InventoryObservation {
        name: name?,
        sku,
        description: description.map(str::to_string),
        category,
        provenance,
    })
}

/// Classify one line item; `None` means it is not an inventory product or
/// has no usable name.
pub fn classify_line_item(
    kind: SourceKind,
    item: &LineItemRecord,
    vocab: &Vocabulary,
) -> Option<InventoryObservation> {
    let (category, provenance) = match kind {
        SourceKind::Jobs => job_acceptance(item)?,
        SourceKind::Quotes => quote_acceptance(item, vocab)?,
    };
    resolve_identity(item, vocab, category, provenance)
}

/// Observations for every accepted line item of one job or quote.
pub fn extract_observations(
    kind: SourceKind,
    record: &SourceRecord,
    vocab: &Vocabulary,
) -> Vec<InventoryObservation> {
    record
        .line_items()
        .iter()
        .filter_map(|item| classify_line_item(kind, item, vocab))
        .collect()
}
