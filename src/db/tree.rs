//! Helpers for addressing a `serde_json::Value` as a tree.

use serde_json::{Map, Value};

use super::StorePath;

pub fn get<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Replaces the subtree at `path`. A `null` value removes it, and parents
/// left empty by the removal are pruned.
pub fn set(root: &mut Value, path: &StorePath, value: Value) {
    if value.is_null() {
        remove(root, path.segments());
        return;
    }
    let mut node = root;
    for segment in path.segments() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map.entry(segment.clone()).or_insert(Value::Null);
    }
    *node = value;
}

fn remove(node: &mut Value, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        *node = Value::Null;
        return;
    };
    if let Value::Object(map) = node {
        if rest.is_empty() {
            map.remove(first);
        } else if let Some(child) = map.get_mut(first) {
            remove(child, rest);
            if child.is_null() || child.as_object().map_or(false, Map::is_empty) {
                map.remove(first);
            }
        }
        if map.is_empty() {
            *node = Value::Null;
        }
    }
}

/// Leaves of `value`, keyed by their path below `base`.
pub fn flatten(base: &StorePath, value: &Value) -> Vec<(StorePath, Value)> {
    let mut leaves = Vec::new();
    flatten_into(base, value, &mut leaves);
    leaves
}

fn flatten_into(path: &StorePath, value: &Value, out: &mut Vec<(StorePath, Value)>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(&path.child(key.clone()), child, out);
            }
        }
        leaf => out.push((path.clone(), leaf.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_nodes() {
        let mut root = Value::Null;
        set(&mut root, &StorePath::parse("election/groups/head/name"), json!("Chair"));
        assert_eq!(root, json!({"election": {"groups": {"head": {"name": "Chair"}}}}));
        assert_eq!(
            get(&root, &StorePath::parse("election/groups/head")),
            Some(&json!({"name": "Chair"}))
        );
        assert_eq!(get(&root, &StorePath::parse("election/wrongVotes")), None);
    }

    #[test]
    fn removing_prunes_empty_parents() {
        let mut root = json!({"election": {"voteLog": {"k1": {"type": "add"}}, "wrongVotes": 2}});
        set(&mut root, &StorePath::parse("election/voteLog/k1"), Value::Null);
        assert_eq!(root, json!({"election": {"wrongVotes": 2}}));
        set(&mut root, &StorePath::parse("election"), Value::Null);
        assert_eq!(get(&root, &StorePath::root()), None);
    }

    #[test]
    fn set_below_a_leaf_replaces_the_leaf() {
        let mut root = json!({"election": {"wrongVotes": 2}});
        set(&mut root, &StorePath::parse("election/wrongVotes/today"), json!(1));
        assert_eq!(root, json!({"election": {"wrongVotes": {"today": 1}}}));

        let mut scalar_root = json!(7);
        set(&mut scalar_root, &StorePath::parse("isActive"), json!(true));
        assert_eq!(scalar_root, json!({"isActive": true}));
    }

    #[test]
    fn flatten_lists_leaves_only() {
        let value = json!({"a": {"b": 1, "c": {"d": "x"}}, "e": null});
        let mut leaves = flatten(&StorePath::parse("root"), &value);
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            leaves,
            vec![
                (StorePath::parse("root/a/b"), json!(1)),
                (StorePath::parse("root/a/c/d"), json!("x")),
            ]
        );
    }
}
