//! Metadata records and the package list kept on top of them

use serde_json::{Map, Value};
use tandem_common::{MetadataPatch, MetadataRecord};

/// Key holding the time a package joined the package list
pub const ADDED_KEY: &str = "added";

/// Apply `patch` in place, returning whether the record is now empty
pub fn apply_patch(record: &mut Map<String, Value>, patch: MetadataPatch) -> bool {
    for key in &patch.remove {
        record.remove(key);
    }
    for (key, value) in patch.add {
        record.insert(key, value);
    }
    record.is_empty()
}

/// Patch marking a package as listed at `added_ms`
pub fn added_patch(added_ms: i64) -> MetadataPatch {
    let mut add = Map::new();
    add.insert(ADDED_KEY.to_string(), Value::from(added_ms));
    MetadataPatch {
        add,
        remove: Vec::new(),
    }
}

/// Patch taking a package off the list
pub fn removed_patch() -> MetadataPatch {
    MetadataPatch {
        add: Map::new(),
        remove: vec![ADDED_KEY.to_string()],
    }
}

/// Names of listed packages, oldest first
pub fn package_list(records: Vec<MetadataRecord>) -> Vec<String> {
    let mut listed: Vec<(i64, String)> = records
        .into_iter()
        .filter_map(|r| {
            r.metadata
                .get(ADDED_KEY)
                .and_then(Value::as_i64)
                .map(|added| (added, r.name))
        })
        .collect();
    listed.sort();
    listed.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, added: Option<i64>) -> MetadataRecord {
        let mut metadata = Map::new();
        if let Some(added) = added {
            metadata.insert(ADDED_KEY.to_string(), Value::from(added));
        }
        metadata.insert("other".to_string(), Value::Bool(true));
        MetadataRecord {
            name: name.to_string(),
            metadata,
        }
    }

    #[test]
    fn test_package_list_sorted_by_added() {
        let names = package_list(vec![
            record("zeta", Some(1)),
            record("alpha", Some(3)),
            record("hidden", None),
            record("mid", Some(2)),
        ]);
        assert_eq!(names, vec!["zeta", "mid", "alpha"]);
    }

    #[test]
    fn test_apply_patch() {
        let mut map = Map::new();
        assert!(!apply_patch(&mut map, added_patch(5)));
        assert_eq!(map.get(ADDED_KEY), Some(&Value::from(5)));
        assert!(apply_patch(&mut map, removed_patch()));
    }
}
