//! Merging destination and source snapshots.

use std::collections::BTreeMap;

use crate::node::{Node, NodeMap};

/// Key-wise union of a destination snapshot and a source snapshot.
///
/// A node present on both sides keeps its destination fields and takes the
/// source hash, size and url. A node present on one side only comes out with
/// the other side's fields empty.
pub fn merge(destination: &NodeMap, remote: &NodeMap) -> NodeMap {
    let mut merged = NodeMap::with_capacity(destination.len() + remote.len());
    for (id, node) in destination {
        let mut node = node.clone();
        node.clear_remote();
        merged.insert(id.clone(), node);
    }
    for (id, from) in remote {
        let node = merged.entry(id.clone()).or_insert_with(|| {
            let mut node = from.clone();
            node.clear_local();
            node
        });
        node.remote_hash = from.remote_hash.clone();
        node.remote_hash_type = from.remote_hash_type.clone();
        node.remote_file_size = from.remote_file_size;
        node.url = from.url.clone();
    }
    merged
}

/// Synthesize folder nodes from the parent paths of all files.
///
/// Empty segments (`a//b.txt`) are skipped. Returned in id order.
pub fn build_folders(nodes: &NodeMap) -> Vec<Node> {
    let mut folders: BTreeMap<String, Node> = BTreeMap::new();
    for node in nodes.values().filter(|n| n.is_file) {
        let mut prefix = String::new();
        for segment in node.path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            folders
                .entry(prefix.clone())
                .or_insert_with(|| Node::folder(prefix.clone()));
        }
    }
    folders.into_values().collect()
}

/// Nodes ordered by id, for stable output.
pub fn sorted(nodes: &NodeMap) -> Vec<Node> {
    let mut out: Vec<Node> = nodes.values().cloned().collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rdmsync_common::HashType;

    fn dest(id: &str, hash: &str) -> Node {
        Node::file(id).with_local(hash, HashType::Md5)
    }

    fn src(id: &str, hash: &str) -> Node {
        Node::file(id).with_remote(hash, HashType::Md5, 3)
    }

    fn map(nodes: Vec<Node>) -> NodeMap {
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect()
    }

    #[test]
    fn test_merge_overlapping() {
        let d = map(vec![dest("a.txt", "h1")]);
        let mut remote = src("a.txt", "h2");
        remote.url = "https://example.org/a.txt".to_string();
        let r = map(vec![remote]);

        let merged = merge(&d, &r);
        let a = &merged["a.txt"];
        assert_eq!(a.local_hash, "h1");
        assert_eq!(a.remote_hash, "h2");
        assert_eq!(a.remote_file_size, 3);
        assert_eq!(a.url, "https://example.org/a.txt");
    }

    #[test]
    fn test_merge_one_sided() {
        let d = map(vec![dest("gone.txt", "h1")]);
        let r = map(vec![src("fresh.txt", "h2")]);
        let merged = merge(&d, &r);

        assert_eq!(merged["gone.txt"].remote_hash, "");
        assert_eq!(merged["fresh.txt"].local_hash, "");
        assert!(merged["fresh.txt"].local_hash_type.is_none());
    }

    #[test]
    fn test_build_folders() {
        let nodes = map(vec![
            src("a/b/c.txt", "x"),
            src("a/d.txt", "y"),
            src("top.txt", "z"),
            src("odd//e.txt", "w"),
        ]);
        let folders = build_folders(&nodes);
        let ids: Vec<&str> = folders.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a/b", "odd"]);
        let ab = &folders[1];
        assert_eq!(ab.name, "b");
        assert_eq!(ab.path, "a");
        assert!(!ab.is_file);
    }

    proptest! {
        #[test]
        fn prop_merge_disjoint_keeps_everything(
            d_ids in proptest::collection::hash_set("[a-m]{1,6}", 0..12),
            r_ids in proptest::collection::hash_set("[n-z]{1,6}", 0..12),
        ) {
            let d = map(d_ids.iter().map(|id| dest(id, "local")).collect());
            let r = map(r_ids.iter().map(|id| src(id, "remote")).collect());
            let merged = merge(&d, &r);

            prop_assert_eq!(merged.len(), d.len() + r.len());
            for (id, node) in d.iter().chain(r.iter()) {
                prop_assert_eq!(&merged[id], node);
            }
        }
    }
}
