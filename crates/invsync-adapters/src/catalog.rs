//! Product catalog export (CSV) reader used to seed the ledger.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use indexmap::IndexMap;
use invsync_core::{CombinedEntry, IdentityKey, Vocabulary};
use tracing::debug;

use crate::classify::{is_name_sku, strip_sku_token};
use crate::AdapterError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogImport {
    /// Zero-count entries in display order.
    pub entries: Vec<CombinedEntry>,
    pub rows_read: usize,
    pub rows_skipped: usize,
}

struct ColumnIndex {
    name: usize,
    description: Option<usize>,
    category: Option<usize>,
}

impl ColumnIndex {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, AdapterError> {
        let find = |wanted: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(wanted))
        };
        let name = find("Name")
            .ok_or_else(|| AdapterError::Protocol("catalog csv has no Name column".to_string()))?;
        Ok(Self {
            name,
            description: find("Description"),
            category: find("Category"),
        })
    }
}

fn field(record: &csv::StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| record.get(i)).map(str::trim).unwrap_or_default()
}

pub fn load_catalog_csv(
    path: impl AsRef<Path>,
    detect_skus: bool,
    vocab: &Vocabulary,
) -> Result<CatalogImport, AdapterError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_catalog(file, detect_skus, vocab)
}

/// Rows with an empty name or a SERVICE category are skipped. With
/// `detect_skus`, a code-like name becomes the SKU and the description takes
/// its place as the name.
pub fn parse_catalog<R: Read>(
    reader: R,
    detect_skus: bool,
    vocab: &Vocabulary,
) -> Result<CatalogImport, AdapterError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = ColumnIndex::from_headers(csv_reader.headers()?)?;

    let mut import = CatalogImport::default();
    let mut by_key: IndexMap<IdentityKey, CombinedEntry> = IndexMap::new();

    for record in csv_reader.records() {
        let record = record?;
        import.rows_read += 1;

        let raw_name = field(&record, Some(columns.name));
        let description = field(&record, columns.description);
        let category = field(&record, columns.category);

        if raw_name.is_empty() || category.eq_ignore_ascii_case("SERVICE") {
            import.rows_skipped += 1;
            continue;
        }

        let (name, sku) = if detect_skus && is_name_sku(raw_name, vocab) {
            let name = if description.is_empty() {
                raw_name.to_string()
            } else {
                strip_sku_token(description, raw_name)
            };
            (name, raw_name.to_string())
        } else {
            (raw_name.to_string(), String::new())
        };

        let description = (!description.is_empty()).then(|| description.to_string());
        let key = IdentityKey::new(&name, Some(&sku));
        by_key
            .entry(key)
            .and_modify(|existing| {
                if description.is_some() {
                    existing.description = description.clone();
                }
            })
            .or_insert(CombinedEntry {
                sku,
                name,
                description,
                quotes_count: 0,
                jobs_count: 0,
            });
    }

    import.entries = by_key.into_values().collect();
    import.entries.sort_by(CombinedEntry::display_order);
    debug!(
        rows = import.rows_read,
        skipped = import.rows_skipped,
        entries = import.entries.len(),
        "parsed catalog csv"
    );
    Ok(import)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = "\
Name,Description,Category,Unit Price
PS636WR,Patriot Series 6' long x 36\" wide with handrails,Product,1200
Rubber Threshold Ramp,,PRODUCT,80
Ramp Installation,Labor per hour,SERVICE,95
,orphan row,Product,1
RAEZ0110,,Product,40
PS636WR,Patriot 6' ramp (updated),Product,1250
";

    #[test]
    fn catalog_rows_become_zero_count_entries() {
        let import = parse_catalog(CATALOG.as_bytes(), true, &Vocabulary::default()).unwrap();
        assert_eq!(import.rows_read, 6);
        assert_eq!(import.rows_skipped, 2);

        let summary = import
            .entries
            .iter()
            .map(|e| (e.sku.as_str(), e.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("PS636WR", "Patriot 6' ramp (updated)"),
                ("PS636WR", "Patriot Series 6' long x 36\" wide with handrails"),
                ("RAEZ0110", "RAEZ0110"),
                ("", "Rubber Threshold Ramp"),
            ]
        );
        assert!(import.entries.iter().all(|e| e.total_allocated() == 0));
    }

    #[test]
    fn sku_detection_can_be_disabled() {
        let import = parse_catalog(CATALOG.as_bytes(), false, &Vocabulary::default()).unwrap();
        assert!(import.entries.iter().all(|e| e.sku.is_empty()));
        let patriot = import.entries.iter().find(|e| e.name == "PS636WR").unwrap();
        assert_eq!(patriot.description.as_deref(), Some("Patriot 6' ramp (updated)"));
    }

    #[test]
    fn header_lookup_ignores_case() {
        let csv = "name,DESCRIPTION\nGrab bar,Stainless 24in\n";
        let import = parse_catalog(csv.as_bytes(), true, &Vocabulary::default()).unwrap();
        assert_eq!(import.entries.len(), 1);
        assert_eq!(import.entries[0].description.as_deref(), Some("Stainless 24in"));
    }

    #[test]
    fn missing_name_column_is_an_error() {
        let csv = "Title,Description\nGrab bar,Stainless\n";
        let err = parse_catalog(csv.as_bytes(), true, &Vocabulary::default()).unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }
}
