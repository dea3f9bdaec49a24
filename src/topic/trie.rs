//! Topic trie for subscription matching
//!
//! A prefix tree keyed by topic level. Every node carries the value for
//! filters ending there, a `+` child and the value for a `#` ending there.
//! Nodes left empty by a removal are pruned on the way back up.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value for filters ending at this node
    value: Option<V>,
    /// Literal children indexed by topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a multi-level wildcard (#) at this level
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie keyed by validated topic filters
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Get the value stored for `filter`, inserting one built by `default`
    /// if the filter is new. The filter must already be validated.
    pub fn get_or_insert_with<F>(&mut self, filter: &str, default: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let mut node = &mut self.root;

        for level in filter.split('/') {
            match level {
                "#" => return node.multi_wildcard.get_or_insert_with(default),
                "+" => {
                    node = node
                        .single_wildcard
                        .get_or_insert_with(|| Box::new(TrieNode::new()));
                }
                _ => {
                    node = node.children.entry(CompactString::new(level)).or_default();
                }
            }
        }

        node.value.get_or_insert_with(default)
    }

    /// Remove the value stored for `filter` when `pred` returns true for it.
    ///
    /// `pred` gets mutable access, so callers can shrink the value and ask
    /// for removal only once it is empty. Returns the removed value.
    pub fn remove_where<F>(&mut self, filter: &str, pred: F) -> Option<V>
    where
        F: FnOnce(&mut V) -> bool,
    {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels, pred)
    }

    /// Remove the value stored for `filter`
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        self.remove_where(filter, |_| true)
    }

    fn remove_recursive<F>(node: &mut TrieNode<V>, levels: &[&str], pred: F) -> Option<V>
    where
        F: FnOnce(&mut V) -> bool,
    {
        let Some((&level, rest)) = levels.split_first() else {
            return take_if(&mut node.value, pred);
        };

        match level {
            "#" => take_if(&mut node.multi_wildcard, pred),
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_recursive(child, rest, pred);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest, pred);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Call `callback` with every value whose filter matches `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        let wildcards_allowed = !(is_system_topic && index == 0);

        // `#` here also covers the parent level itself (zero remaining levels)
        if wildcards_allowed {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        if index >= levels.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn take_if<V, F>(slot: &mut Option<V>, pred: F) -> Option<V>
where
    F: FnOnce(&mut V) -> bool,
{
    let remove = match slot.as_mut() {
        Some(v) => pred(v),
        None => false,
    };
    if remove {
        slot.take()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<i32>, topic: &str) -> Vec<i32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        *trie.get_or_insert_with("test/topic", || 0) = 1;

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
        assert!(collect(&trie, "test").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("test/+", || 1);
        trie.get_or_insert_with("+/topic", || 2);
        trie.get_or_insert_with("+/+", || 3);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3]);
        assert!(collect(&trie, "test").is_empty());
    }

    #[test]
    fn test_multi_wildcard_matches_parent() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("#", || 1);
        trie.get_or_insert_with("test/#", || 2);

        assert_eq!(collect(&trie, "test/topic/deep"), vec![1, 2]);
        assert_eq!(collect(&trie, "test"), vec![1, 2]);
        assert_eq!(collect(&trie, "other"), vec![1]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("#", || 1);
        trie.get_or_insert_with("+/test", || 2);
        trie.get_or_insert_with("$SYS/#", || 3);
        trie.get_or_insert_with("$SYS/+", || 4);

        assert_eq!(collect(&trie, "$SYS/test"), vec![3, 4]);
    }

    #[test]
    fn test_existing_value_is_returned() {
        let mut trie = TopicTrie::new();
        *trie.get_or_insert_with("a/b", || 1) += 10;
        assert_eq!(*trie.get_or_insert_with("a/b", || 100), 11);
    }

    #[test]
    fn test_remove_prunes_nodes() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("a/+/c/d", || 1);
        trie.get_or_insert_with("a/#", || 2);

        assert_eq!(trie.remove("a/+/c/d"), Some(1));
        assert!(!trie.is_empty());
        assert_eq!(trie.remove("a/#"), Some(2));
        assert!(trie.is_empty());
        assert_eq!(trie.remove("a/#"), None);
    }

    #[test]
    fn test_remove_where_keeps_value() {
        let mut trie: TopicTrie<Vec<i32>> = TopicTrie::new();
        trie.get_or_insert_with("x/y", Vec::new).extend([1, 2]);

        let removed = trie.remove_where("x/y", |v| {
            v.retain(|&n| n != 1);
            v.is_empty()
        });
        assert!(removed.is_none());

        let mut seen = Vec::new();
        trie.matches("x/y", |v| seen.extend(v.iter().copied()));
        assert_eq!(seen, vec![2]);

        let removed = trie.remove_where("x/y", |v| {
            v.clear();
            true
        });
        assert_eq!(removed, Some(vec![]));
        assert!(trie.is_empty());
    }
}
