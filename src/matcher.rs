// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The subject-matching engine (C4): an interest trie keyed by subject
//! token, with a whole-cache-clear-on-mutation match cache.
//!
//! The matching recursion below is a direct translation of
//! `SubjectMatchingEngine::getMatchingSubscriptionInfos` in the original
//! C++ source: the `>` branch fires whenever a node has a `>` child,
//! regardless of how many tokens remain, which is what gives `>` its
//! "requires at least one trailing token" boundary behavior, since a
//! `>` child can only be *reached* by recursing past the node it hangs
//! off of, and recursion only continues when more tokens remain.
//!
//! Known limitation carried over from the original design (spec §9):
//! `remove_subscription` never prunes nodes left with no subscriptions
//! and no live children. A long-running gateway accumulates nodes
//! proportional to historical subject cardinality. A periodic prune
//! pass is future work, not implemented here.

use std::collections::HashMap;

pub type OwnerKey = u64;

/// One subscription record stored at a trie node.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord<T> {
    pub subscription_id: u32,
    pub target: T,
}

#[derive(Default)]
struct Node<T> {
    literal: HashMap<String, Box<Node<T>>>,
    star: Option<Box<Node<T>>>,
    greater_than: Option<Box<Node<T>>>,
    subs: HashMap<OwnerKey, SubscriptionRecord<T>>,
}

impl<T> Node<T> {
    fn new() -> Node<T> {
        Node {
            literal: HashMap::new(),
            star: None,
            greater_than: None,
            subs: HashMap::new(),
        }
    }
}

/// The interest trie plus its match cache.
pub struct MatchEngine<T> {
    root: Node<T>,
    cache: HashMap<String, Vec<SubscriptionRecord<T>>>,
    caching_enabled: bool,
}

impl<T: Clone> MatchEngine<T> {
    pub fn new() -> MatchEngine<T> {
        MatchEngine {
            root: Node::new(),
            cache: HashMap::new(),
            caching_enabled: true,
        }
    }

    pub fn with_caching(caching_enabled: bool) -> MatchEngine<T> {
        MatchEngine {
            root: Node::new(),
            cache: HashMap::new(),
            caching_enabled,
        }
    }

    fn get_or_create_node(&mut self, pattern: &str) -> &mut Node<T> {
        let mut node = &mut self.root;
        for token in crate::subject::tokenize(pattern) {
            node = match token {
                crate::subject::WILDCARD_STAR => {
                    node.star.get_or_insert_with(|| Box::new(Node::new()))
                }
                crate::subject::WILDCARD_GREATER_THAN => node
                    .greater_than
                    .get_or_insert_with(|| Box::new(Node::new())),
                literal => node
                    .literal
                    .entry(literal.to_owned())
                    .or_insert_with(|| Box::new(Node::new())),
            };
        }
        node
    }

    /// Inserts (or replaces, for a repeat add from the same owner) a
    /// subscription. Returns the number of subscription records now
    /// present at the terminal node for this pattern.
    pub fn add_subscription(
        &mut self,
        pattern: &str,
        subscription_id: u32,
        owner: OwnerKey,
        target: T,
    ) -> usize {
        let node = self.get_or_create_node(pattern);
        node.subs.insert(
            owner,
            SubscriptionRecord {
                subscription_id,
                target,
            },
        );
        let count = node.subs.len();
        self.cache.clear();
        count
    }

    /// Removes the subscription for `owner` at `pattern`. Returns the
    /// number of subscription records remaining at the terminal node.
    pub fn remove_subscription(&mut self, pattern: &str, owner: OwnerKey) -> usize {
        let node = self.get_or_create_node(pattern);
        node.subs.remove(&owner);
        let count = node.subs.len();
        self.cache.clear();
        count
    }

    /// Recursively walks the entire trie, including wildcard subtrees,
    /// removing any record keyed by `owner`.
    pub fn remove_all_for_owner(&mut self, owner: OwnerKey) {
        Self::remove_all_for_owner_from(&mut self.root, owner);
        self.cache.clear();
    }

    fn remove_all_for_owner_from(node: &mut Node<T>, owner: OwnerKey) {
        node.subs.remove(&owner);
        for child in node.literal.values_mut() {
            Self::remove_all_for_owner_from(child, owner);
        }
        if let Some(child) = node.star.as_mut() {
            Self::remove_all_for_owner_from(child, owner);
        }
        if let Some(child) = node.greater_than.as_mut() {
            Self::remove_all_for_owner_from(child, owner);
        }
    }

    /// Returns every subscription record whose pattern matches `subject`.
    pub fn match_subject(&mut self, subject: &str) -> Vec<SubscriptionRecord<T>> {
        if self.caching_enabled {
            if let Some(cached) = self.cache.get(subject) {
                return cached.clone();
            }
        }

        let tokens = crate::subject::tokenize(subject);
        let mut results = Vec::new();
        if !tokens.is_empty() {
            let last = tokens.len() - 1;
            Self::collect(&self.root, &tokens, 0, last, &mut results);
        }

        if self.caching_enabled {
            self.cache.insert(subject.to_owned(), results.clone());
        }

        results
    }

    fn collect(
        node: &Node<T>,
        tokens: &[&str],
        index: usize,
        last: usize,
        out: &mut Vec<SubscriptionRecord<T>>,
    ) {
        let token = tokens[index];
        if let Some(child) = node.literal.get(token) {
            if index == last {
                Self::emit(child, out);
            } else {
                Self::collect(child, tokens, index + 1, last, out);
            }
        }

        if let Some(child) = node.greater_than.as_ref() {
            Self::emit(child, out);
        }

        if let Some(child) = node.star.as_ref() {
            if index == last {
                Self::emit(child, out);
            } else {
                Self::collect(child, tokens, index + 1, last, out);
            }
        }
    }

    fn emit(node: &Node<T>, out: &mut Vec<SubscriptionRecord<T>>) {
        out.extend(node.subs.values().cloned());
    }
}

impl<T: Clone> Default for MatchEngine<T> {
    fn default() -> Self {
        MatchEngine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(records: &[SubscriptionRecord<u32>]) -> Vec<u32> {
        let mut v: Vec<u32> = records.iter().map(|r| r.subscription_id).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn s1_exact_match_single_service() {
        let mut engine: MatchEngine<u32> = MatchEngine::new();
        engine.add_subscription("orders.new", 10, 1, 1);
        let matches = engine.match_subject("orders.new");
        assert_eq!(ids(&matches), vec![10]);
    }

    #[test]
    fn s2_tail_wildcard() {
        let mut engine: MatchEngine<u32> = MatchEngine::new();
        engine.add_subscription("orders.>", 20, 1, 1);
        engine.add_subscription("orders.new", 21, 2, 2);
        engine.add_subscription(">", 22, 3, 3);

        assert_eq!(ids(&engine.match_subject("orders.new")), vec![20, 21, 22]);
        assert_eq!(ids(&engine.match_subject("orders.new.eu")), vec![20, 22]);
        assert_eq!(ids(&engine.match_subject("orders")), vec![22]);
    }

    #[test]
    fn s3_single_token_wildcard() {
        let mut engine: MatchEngine<u32> = MatchEngine::new();
        engine.add_subscription("A.*.C", 30, 1, 1);

        assert_eq!(ids(&engine.match_subject("A.B.C")), vec![30]);
        assert!(engine.match_subject("A.C").is_empty());
        assert!(engine.match_subject("A.B.C.D").is_empty());
    }

    #[test]
    fn duplicate_owner_replaces_not_duplicates() {
        let mut engine: MatchEngine<u32> = MatchEngine::new();
        engine.add_subscription("t", 1, 100, 1);
        let count = engine.add_subscription("t", 2, 100, 1);
        assert_eq!(count, 1);
        assert_eq!(ids(&engine.match_subject("t")), vec![2]);
    }

    #[test]
    fn i4_owner_purge_clears_every_subtree() {
        let mut engine: MatchEngine<u32> = MatchEngine::new();
        engine.add_subscription("a.b", 1, 42, 1);
        engine.add_subscription("a.*", 2, 42, 1);
        engine.add_subscription(">", 3, 42, 1);
        engine.add_subscription("a.b", 4, 7, 1);

        engine.remove_all_for_owner(42);

        assert_eq!(ids(&engine.match_subject("a.b")), vec![4]);
        assert!(engine.match_subject("q").is_empty());
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_engine_empty() {
        let mut engine: MatchEngine<u32> = MatchEngine::new();
        engine.add_subscription("t", 1, 1, 1);
        let remaining = engine.remove_subscription("t", 1);
        assert_eq!(remaining, 0);
        assert!(engine.match_subject("t").is_empty());
    }

    #[test]
    fn cache_result_matches_non_cached_result() {
        let mut cached: MatchEngine<u32> = MatchEngine::with_caching(true);
        let mut uncached: MatchEngine<u32> = MatchEngine::with_caching(false);

        for engine in [&mut cached, &mut uncached] {
            engine.add_subscription("orders.>", 1, 1, 1);
            engine.add_subscription("orders.new", 2, 2, 2);
        }

        let first = ids(&cached.match_subject("orders.new"));
        let second = ids(&cached.match_subject("orders.new"));
        assert_eq!(first, second);
        assert_eq!(first, ids(&uncached.match_subject("orders.new")));
    }
}
