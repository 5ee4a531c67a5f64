//! Collapses re-processed report versions to the newest one per coverage date.

use std::collections::btree_map::{BTreeMap, Entry};

use chrono::NaiveDate;
use ytr_core::ReportDescriptor;

/// Exactly one descriptor per coverage date, iterated in date order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciledReportSet {
    by_date: BTreeMap<NaiveDate, ReportDescriptor>,
}

impl ReconciledReportSet {
    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    pub fn get(&self, coverage_date: NaiveDate) -> Option<&ReportDescriptor> {
        self.by_date.get(&coverage_date)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportDescriptor> {
        self.by_date.values()
    }

    pub fn into_descriptors(self) -> Vec<ReportDescriptor> {
        self.by_date.into_values().collect()
    }
}

/// Keeps the latest `created_at` per coverage date. On equal timestamps the
/// descriptor seen first wins.
pub fn reconcile(descriptors: impl IntoIterator<Item = ReportDescriptor>) -> ReconciledReportSet {
    let mut by_date: BTreeMap<NaiveDate, ReportDescriptor> = BTreeMap::new();
    for descriptor in descriptors {
        match by_date.entry(descriptor.coverage_date) {
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
            }
            Entry::Occupied(mut slot) => {
                if descriptor.created_at > slot.get().created_at {
                    slot.insert(descriptor);
                }
            }
        }
    }
    ReconciledReportSet { by_date }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::{BTreeSet, HashMap};

    fn descriptor(id: &str, day: u32, created: &str) -> ReportDescriptor {
        ReportDescriptor {
            id: id.to_string(),
            download_url: format!("https://example.test/{id}"),
            created_at: created.parse::<DateTime<Utc>>().unwrap(),
            coverage_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
        }
    }

    #[test]
    fn newest_version_per_date_survives() {
        let set = reconcile(vec![
            descriptor("jan1-v1", 1, "2024-01-02T00:00:00Z"),
            descriptor("jan2-v1", 2, "2024-01-03T00:00:00Z"),
            descriptor("jan1-v2", 1, "2024-01-20T00:00:00Z"),
            descriptor("jan1-v0", 1, "2024-01-01T12:00:00Z"),
        ]);

        assert_eq!(set.len(), 2);
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(set.get(jan1).unwrap().id, "jan1-v2");
        let ids: Vec<_> = set.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["jan1-v2", "jan2-v1"]);
    }

    #[test]
    fn equal_creation_times_keep_first_seen() {
        let set = reconcile(vec![
            descriptor("first", 5, "2024-01-06T00:00:00Z"),
            descriptor("second", 5, "2024-01-06T00:00:00Z"),
        ]);
        assert_eq!(set.into_descriptors()[0].id, "first");
    }

    #[test]
    fn empty_input_reconciles_to_empty_set() {
        assert!(reconcile(Vec::new()).is_empty());
    }

    #[test]
    fn one_survivor_per_date_with_maximal_creation_time() {
        // Deterministic pseudo-random spread of versions over a handful of dates.
        let mut seed = 0x2545_f491_u64;
        let mut inputs = Vec::new();
        for i in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let day = (seed >> 33) as u32 % 9 + 1;
            let hour = (seed >> 20) as u32 % 24;
            let minute = (seed >> 10) as u32 % 60;
            inputs.push(descriptor(
                &format!("r{i}"),
                day,
                &format!("2024-02-{:02}T{hour:02}:{minute:02}:00Z", day + 1),
            ));
        }

        let mut expected_max: HashMap<NaiveDate, DateTime<Utc>> = HashMap::new();
        for d in &inputs {
            let entry = expected_max.entry(d.coverage_date).or_insert(d.created_at);
            if d.created_at > *entry {
                *entry = d.created_at;
            }
        }
        let dates: BTreeSet<_> = inputs.iter().map(|d| d.coverage_date).collect();

        let set = reconcile(inputs);
        assert_eq!(set.len(), dates.len());
        for date in dates {
            assert_eq!(set.get(date).unwrap().created_at, expected_max[&date]);
        }
    }
}
