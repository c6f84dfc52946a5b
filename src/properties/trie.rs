//! Prefix trie over dotted property names.
//!
//! Prefixes match on whole segments: `stage` matches `stage.x` and `stage`
//! itself but not `stagecoach.x`. A trailing `.` is ignored, and the empty
//! prefix matches every name.

use std::collections::HashMap;

#[derive(Debug)]
struct Node<V> {
    values: Vec<V>,
    children: HashMap<String, Node<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            children: HashMap::new(),
        }
    }
}

/// Values stored under dotted prefixes.
#[derive(Debug)]
pub struct PrefixTrie<V> {
    root: Node<V>,
}

impl<V> Default for PrefixTrie<V> {
    fn default() -> Self {
        Self {
            root: Node::default(),
        }
    }
}

fn segments(prefix: &str) -> impl Iterator<Item = &str> {
    let trimmed = prefix.strip_suffix('.').unwrap_or(prefix);
    trimmed.split('.').filter(|segment| !segment.is_empty())
}

impl<V> PrefixTrie<V> {
    /// An empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `prefix`; several values may share a prefix.
    pub fn insert(&mut self, prefix: &str, value: V) {
        let mut node = &mut self.root;
        for segment in segments(prefix) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.values.push(value);
    }

    /// Remove the first value stored exactly at `prefix` that satisfies `pred`.
    pub fn remove_first<F>(&mut self, prefix: &str, pred: F) -> Option<V>
    where
        F: Fn(&V) -> bool,
    {
        let path: Vec<&str> = segments(prefix).collect();
        Self::remove_at(&mut self.root, &path, &pred)
    }

    fn remove_at<F>(node: &mut Node<V>, path: &[&str], pred: &F) -> Option<V>
    where
        F: Fn(&V) -> bool,
    {
        match path.split_first() {
            None => {
                let index = node.values.iter().position(pred)?;
                Some(node.values.remove(index))
            }
            Some((segment, rest)) => {
                let child = node.children.get_mut(*segment)?;
                let removed = Self::remove_at(child, rest, pred);
                if child.values.is_empty() && child.children.is_empty() {
                    node.children.remove(*segment);
                }
                removed
            }
        }
    }

    /// Every value whose prefix matches `name`, shortest prefix first.
    pub fn matches<'a>(&'a self, name: &str) -> Vec<&'a V> {
        let mut found: Vec<&V> = self.root.values.iter().collect();
        let mut node = &self.root;
        for segment in segments(name) {
            match node.children.get(segment) {
                Some(child) => {
                    found.extend(child.values.iter());
                    node = child;
                }
                None => break,
            }
        }
        found
    }

    /// Every stored value with its normalized prefix (`a.b`, or `""` for the
    /// root), in no particular order.
    pub fn entries(&self) -> Vec<(String, &V)> {
        let mut found = Vec::new();
        Self::collect(&self.root, String::new(), &mut found);
        found
    }

    fn collect<'a>(node: &'a Node<V>, path: String, found: &mut Vec<(String, &'a V)>) {
        found.extend(node.values.iter().map(|value| (path.clone(), value)));
        for (segment, child) in &node.children {
            let child_path = if path.is_empty() {
                segment.clone()
            } else {
                format!("{path}.{segment}")
            };
            Self::collect(child, child_path, found);
        }
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.root.values.is_empty() && self.root.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_matching() {
        let mut trie = PrefixTrie::new();
        trie.insert("stage", "stage");
        trie.insert("stage.x.", "stage.x");
        trie.insert("", "all");
        trie.insert("cam", "cam");

        assert_eq!(trie.matches("stage.x"), vec![&"all", &"stage", &"stage.x"]);
        assert_eq!(trie.matches("stage.y"), vec![&"all", &"stage"]);
        assert_eq!(trie.matches("stage"), vec![&"all", &"stage"]);
        assert_eq!(trie.matches("camera.exposure"), vec![&"all"]);
    }

    #[test]
    fn test_entries_report_normalized_prefixes() {
        let mut trie = PrefixTrie::new();
        trie.insert("camera.", 1);
        trie.insert("", 2);
        trie.insert("stage.x", 3);
        let mut entries: Vec<(String, i32)> =
            trie.entries().into_iter().map(|(p, v)| (p, *v)).collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (String::new(), 2),
                ("camera".to_string(), 1),
                ("stage.x".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_character_prefix_is_not_a_segment_prefix() {
        let mut trie = PrefixTrie::new();
        trie.insert("cam", "cam");
        trie.insert("camera.", "camera");
        assert_eq!(trie.matches("camera.exposure_time"), vec![&"camera"]);
        assert_eq!(trie.matches("cam.x"), vec![&"cam"]);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut trie = PrefixTrie::new();
        trie.insert("a.b.c", 1);
        trie.insert("a.b.c", 2);
        assert_eq!(trie.remove_first("a.b.c", |v| *v == 2), Some(2));
        assert_eq!(trie.remove_first("a.b.c", |v| *v == 2), None);
        assert_eq!(trie.matches("a.b.c.d"), vec![&1]);
        assert_eq!(trie.remove_first("a.b.c.", |v| *v == 1), Some(1));
        assert!(trie.is_empty());
    }
}
