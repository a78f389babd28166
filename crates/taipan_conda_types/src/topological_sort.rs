use std::collections::{BTreeMap, HashMap, HashSet};

use crate::package_record::PackageRecord;

/// Sorts the records topologically: every record comes after the records it
/// depends on (for dependencies that are part of the input set). Cycles are
/// broken at an arbitrary but deterministic edge; ties are broken by package
/// name so the output is stable for a given input set.
///
/// This is the order in which packages must be linked, and the reverse of
/// the order in which they can be unlinked.
pub fn topological_sort<T: AsRef<PackageRecord>>(records: Vec<T>) -> Vec<T> {
    // Map each name to its index in the input.
    let by_name: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(index, record)| (record.as_ref().name.as_str(), index))
        .collect();

    // Dependency edges restricted to the input set; the dependency name is
    // the first whitespace-delimited token of the raw spec string.
    let mut dependencies: Vec<HashSet<usize>> = records
        .iter()
        .map(|record| {
            record
                .as_ref()
                .depends
                .iter()
                .filter_map(|spec| {
                    let name = spec
                        .split(|c: char| c.is_whitespace() || matches!(c, '=' | '<' | '>' | '!' | '~'))
                        .next()?;
                    by_name.get(name).copied()
                })
                .collect()
        })
        .collect();

    // Kahn's algorithm over a name-keyed ready set for determinism.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for (index, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(index);
        }
    }

    let mut ready: BTreeMap<&str, usize> = records
        .iter()
        .enumerate()
        .filter(|(index, _)| dependencies[*index].is_empty())
        .map(|(index, record)| (record.as_ref().name.as_str(), index))
        .collect();

    let mut order = Vec::with_capacity(records.len());
    let mut placed = vec![false; records.len()];
    loop {
        while let Some((&name, &index)) = ready.iter().next() {
            ready.remove(name);
            placed[index] = true;
            order.push(index);
            for &dependent in &dependents[index] {
                let deps = &mut dependencies[dependent];
                deps.remove(&index);
                if deps.is_empty() && !placed[dependent] {
                    ready.insert(records[dependent].as_ref().name.as_str(), dependent);
                }
            }
        }

        if order.len() == records.len() {
            break;
        }

        // A cycle remains: break it at the unplaced record with the smallest
        // name by dropping its remaining in-edges.
        let cycle_entry = records
            .iter()
            .enumerate()
            .filter(|(index, _)| !placed[*index])
            .map(|(index, record)| (index, record.as_ref().name.as_str()))
            .min_by_key(|(_, name)| *name)
            .map(|(index, _)| index)
            .expect("there is an unplaced record");
        dependencies[cycle_entry].clear();
        ready.insert(records[cycle_entry].as_ref().name.as_str(), cycle_entry);
    }

    // Reorder the input without cloning the records.
    let mut slots: Vec<Option<T>> = records.into_iter().map(Some).collect();
    order
        .into_iter()
        .map(|index| slots[index].take().expect("each index appears once"))
        .collect()
}

#[cfg(test)]
mod test {
    use super::topological_sort;
    use crate::package_record::PackageRecord;

    fn record(name: &str, depends: &[&str]) -> PackageRecord {
        let mut record = PackageRecord::new(
            name.to_owned(),
            "1.0".parse().unwrap(),
            "0".to_owned(),
        );
        record.depends = depends.iter().map(|s| (*s).to_owned()).collect();
        record
    }

    fn position(sorted: &[PackageRecord], name: &str) -> usize {
        sorted.iter().position(|r| r.name == name).unwrap()
    }

    #[test]
    fn test_dependencies_come_first() {
        let records = vec![
            record("python", &["libzlib", "openssl >=3"]),
            record("numpy", &["python"]),
            record("openssl", &[]),
            record("libzlib", &[]),
        ];

        let sorted = topological_sort(records);
        assert_eq!(sorted.len(), 4);
        assert!(position(&sorted, "libzlib") < position(&sorted, "python"));
        assert!(position(&sorted, "openssl") < position(&sorted, "python"));
        assert!(position(&sorted, "python") < position(&sorted, "numpy"));
    }

    #[test]
    fn test_deterministic() {
        let records = || {
            vec![
                record("b", &[]),
                record("a", &[]),
                record("c", &["a", "b"]),
            ]
        };
        let first = topological_sort(records());
        let second = topological_sort(records());
        let names = |sorted: &[PackageRecord]| {
            sorted.iter().map(|r| r.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_terminates() {
        let records = vec![record("a", &["b"]), record("b", &["a"])];
        let sorted = topological_sort(records);
        assert_eq!(sorted.len(), 2);
    }
}
