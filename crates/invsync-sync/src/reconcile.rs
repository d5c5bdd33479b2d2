//! Per-source aggregation and the quotes/jobs merge.

use indexmap::IndexMap;
use invsync_core::{AggregatedEntry, CombinedEntry, IdentityKey, InventoryObservation};

/// Count observations from one source by identity key, most frequent first.
///
/// Description never splits identity: each key carries the last non-empty
/// description seen. Ties keep first-seen order.
pub fn aggregate(observations: &[InventoryObservation]) -> Vec<AggregatedEntry> {
    let mut by_key: IndexMap<IdentityKey, AggregatedEntry> = IndexMap::new();
    for obs in observations {
        let key = obs.identity_key();
        let description = obs.description.clone().filter(|d| !d.is_empty());
        by_key
            .entry(key)
            .and_modify(|entry| {
                entry.count += 1;
                if description.is_some() {
                    entry.description = description.clone();
                }
            })
            .or_insert_with_key(|key| AggregatedEntry {
                name: key.name.clone(),
                sku: key.sku.clone(),
                description: description.clone(),
                count: 1,
            });
    }

    let mut entries = by_key.into_values().collect::<Vec<_>>();
    entries.sort_by(|a, b| b.count.cmp(&a.count));
    entries
}

/// Combine quotes-side and jobs-side counts into one list in display order.
///
/// Counts stay independent. A jobs-side description replaces the quotes-side
/// one; a jobs-side entry without a description keeps what quotes supplied.
pub fn merge(quotes: &[AggregatedEntry], jobs: &[AggregatedEntry]) -> Vec<CombinedEntry> {
    let mut combined: IndexMap<IdentityKey, CombinedEntry> = IndexMap::new();

    for entry in quotes {
        combined
            .entry(entry.identity_key())
            .and_modify(|c| {
                c.quotes_count += entry.count;
                if entry.description.is_some() {
                    c.description = entry.description.clone();
                }
            })
            .or_insert_with_key(|key| CombinedEntry {
                sku: key.sku.clone(),
                name: key.name.clone(),
                description: entry.description.clone(),
                quotes_count: entry.count,
                jobs_count: 0,
            });
    }

    for entry in jobs {
        combined
            .entry(entry.identity_key())
            .and_modify(|c| {
                c.jobs_count += entry.count;
                if entry.description.is_some() {
                    c.description = entry.description.clone();
                }
            })
            .or_insert_with_key(|key| CombinedEntry {
                sku: key.sku.clone(),
                name: key.name.clone(),
                description: entry.description.clone(),
                quotes_count: 0,
                jobs_count: entry.count,
            });
    }

    let mut entries = combined.into_values().collect::<Vec<_>>();
    entries.sort_by(CombinedEntry::display_order);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use invsync_core::{Category, FieldOrigin, Provenance};

    fn obs(name: &str, sku: Option<&str>, description: Option<&str>) -> InventoryObservation {
        InventoryObservation {
            name: name.to_string(),
            sku: sku.map(String::from),
            description: description.map(String::from),
            category: Category::Product,
            provenance: Provenance::new().with(FieldOrigin::LineItemName),
        }
    }

    fn agg(name: &str, sku: &str, description: Option<&str>, count: usize) -> AggregatedEntry {
        AggregatedEntry {
            name: name.to_string(),
            sku: sku.to_string(),
            description: description.map(String::from),
            count,
        }
    }

    #[test]
    fn description_does_not_split_identity() {
        let observations = vec![
            obs("Widget", Some("W1"), Some("blue")),
            obs("Widget", Some("W1"), Some("blue")),
            obs("Widget", Some("W1"), Some("blue")),
            obs("Widget", Some("W1"), Some("blue, large")),
        ];
        let aggregated = aggregate(&observations);
        assert_eq!(aggregated, vec![agg("Widget", "W1", Some("blue, large"), 4)]);
    }

    #[test]
    fn missing_and_empty_sku_share_a_key() {
        let observations = vec![
            obs("Grab bar", None, None),
            obs("Grab bar", Some(""), Some("Stainless")),
            obs("Grab bar", Some("  "), None),
        ];
        let aggregated = aggregate(&observations);
        assert_eq!(aggregated, vec![agg("Grab bar", "", Some("Stainless"), 3)]);
    }

    #[test]
    fn aggregation_sorts_by_count_keeping_first_seen_ties() {
        let observations = vec![
            obs("A", None, None),
            obs("B", Some("B1"), None),
            obs("C", None, None),
            obs("B", Some("B1"), None),
        ];
        let names = aggregate(&observations)
            .into_iter()
            .map(|e| (e.name, e.count))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![("B".to_string(), 2), ("A".to_string(), 1), ("C".to_string(), 1)]
        );
    }

    #[test]
    fn merge_keeps_counts_independent_and_prefers_jobs_description() {
        let merged = merge(
            &[agg("Widget", "W1", Some("quote text"), 2)],
            &[agg("Widget", "W1", Some("job text"), 5)],
        );
        assert_eq!(
            merged,
            vec![CombinedEntry {
                sku: "W1".to_string(),
                name: "Widget".to_string(),
                description: Some("job text".to_string()),
                quotes_count: 2,
                jobs_count: 5,
            }]
        );
    }

    #[test]
    fn jobs_without_description_keep_quotes_description() {
        let merged = merge(&[agg("Widget", "W1", Some("quote text"), 1)], &[agg("Widget", "W1", None, 1)]);
        assert_eq!(merged[0].description.as_deref(), Some("quote text"));
    }

    #[test]
    fn merge_orders_sku_entries_first() {
        let merged = merge(
            &[agg("zeta ramp", "", None, 1), agg("Patriot", "ps636wr", None, 1)],
            &[agg("Alpha bar", "", None, 2), agg("Big Lug", "BL342WR", None, 1)],
        );
        let order = merged
            .iter()
            .map(|e| (e.sku.as_str(), e.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                ("BL342WR", "Big Lug"),
                ("ps636wr", "Patriot"),
                ("", "Alpha bar"),
                ("", "zeta ramp"),
            ]
        );
        assert!(merged.iter().all(|e| e.total_allocated() > 0));
    }
}
