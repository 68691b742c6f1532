//! Prefix matching of instance names.

use std::collections::HashMap;

use crate::instance_name::InstanceName;

const ROOT: usize = 0;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, usize>,
    marked: bool,
}

/// Set of instance names supporting prefix queries.
///
/// Nodes live in an arena and refer to their children by index. The
/// resulting structure depends only on the set of inserted names, not on the
/// order of insertion.
#[derive(Debug)]
pub struct InstanceNameTrie {
    nodes: Vec<Node>,
}

impl Default for InstanceNameTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceNameTrie {
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self { nodes: vec![Node::default()] }
    }

    /// Adds `name` to the set. Inserting a name twice has no effect.
    pub fn insert(&mut self, name: &InstanceName) {
        let mut index = ROOT;
        for component in name.components() {
            index = match self.nodes[index].children.get(component) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[index].children.insert(component.to_owned(), child);
                    child
                },
            };
        }
        self.nodes[index].marked = true;
    }

    /// Returns whether `name` or any of its ancestors was inserted.
    pub fn contains_prefix(&self, name: &InstanceName) -> bool {
        let mut index = ROOT;
        if self.nodes[index].marked {
            return true;
        }
        for component in name.components() {
            match self.nodes[index].children.get(component) {
                Some(&child) => index = child,
                None => return false,
            }
            if self.nodes[index].marked {
                return true;
            }
        }
        false
    }

    /// Returns whether exactly `name` was inserted.
    pub fn contains(&self, name: &InstanceName) -> bool {
        let mut index = ROOT;
        for component in name.components() {
            match self.nodes[index].children.get(component) {
                Some(&child) => index = child,
                None => return false,
            }
        }
        self.nodes[index].marked
    }
}

impl<'a> FromIterator<&'a InstanceName> for InstanceNameTrie {
    fn from_iter<I: IntoIterator<Item = &'a InstanceName>>(names: I) -> Self {
        let mut trie = Self::new();
        for name in names {
            trie.insert(name);
        }
        trie
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn name(s: &str) -> InstanceName {
        InstanceName::new(s).unwrap()
    }

    #[test]
    fn test_empty_trie_matches_nothing() {
        let trie = InstanceNameTrie::new();
        assert!(!trie.contains_prefix(&InstanceName::root()));
        assert!(!trie.contains_prefix(&name("a")));
    }

    #[test]
    fn test_root_matches_everything() {
        let trie: InstanceNameTrie = [InstanceName::root()].iter().collect();
        assert!(trie.contains_prefix(&InstanceName::root()));
        assert!(trie.contains_prefix(&name("a/b/c")));
        assert!(trie.contains(&InstanceName::root()));
        assert!(!trie.contains(&name("a")));
    }

    #[test]
    fn test_prefix_matching_is_per_component() {
        let names = [name("prod/linux"), name("staging")];
        let trie: InstanceNameTrie = names.iter().collect();

        assert!(trie.contains_prefix(&name("prod/linux")));
        assert!(trie.contains_prefix(&name("prod/linux/x86_64")));
        assert!(trie.contains_prefix(&name("staging/anything")));
        assert!(!trie.contains_prefix(&name("prod")));
        assert!(!trie.contains_prefix(&name("prod/linuxx")));
        assert!(!trie.contains_prefix(&InstanceName::root()));

        assert!(trie.contains(&name("prod/linux")));
        assert!(!trie.contains(&name("prod")));
    }

    fn instance_name_strategy() -> impl Strategy<Value = InstanceName> {
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..4)
            .prop_map(|components| name(&components.join("/")))
    }

    proptest! {
        #[test]
        fn insertion_order_is_irrelevant(
            names in prop::collection::vec(instance_name_strategy(), 0..8),
            query in instance_name_strategy(),
        ) {
            let forward: InstanceNameTrie = names.iter().collect();
            let backward: InstanceNameTrie = names.iter().rev().chain(names.iter()).collect();
            prop_assert_eq!(forward.contains_prefix(&query), backward.contains_prefix(&query));
            prop_assert_eq!(forward.contains(&query), backward.contains(&query));
        }

        #[test]
        fn contains_prefix_matches_linear_scan(
            names in prop::collection::vec(instance_name_strategy(), 0..8),
            query in instance_name_strategy(),
        ) {
            let trie: InstanceNameTrie = names.iter().collect();
            let expected = names.iter().any(|prefix| query.has_prefix(prefix));
            prop_assert_eq!(trie.contains_prefix(&query), expected);
        }
    }
}
