//! # Topic trie.
//!
//! Patterns are `/`-delimited. Each segment is matched in one of three ways:
//!
//! ```text
//! exact   a/b/c   matches a/b/c only
//! +       a/+/c   matches a/x/c, not a/x/y/c
//! #       a/#     matches a, a/b, a/b/c   (remainder, zero or more segments)
//! ```
//!
//! A `#` child is consulted at **every** depth the walk visits, independent of the
//! exact/`+` branches at that level. `#` is only valid as the last segment.
//!
//! Node content is either `None` or a non-empty list; nodes that lose their last
//! subscription and have no children are pruned.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::handler::{HandlerRef, identity};
use crate::error::BusError;

const SINGLE: &str = "+";
const MULTI: &str = "#";

/// One registered `(pattern, handler)` pair.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) topic: Arc<str>,
    pub(crate) handler: HandlerRef,
    pub(crate) once: bool,
}

impl Subscription {
    #[inline]
    pub(crate) fn id(&self) -> usize {
        identity(&self.handler)
    }
}

#[derive(Default)]
pub(crate) struct Node {
    children: HashMap<String, Node>,
    subs: Option<Vec<Subscription>>,
}

impl Node {
    /// Validates a pattern and returns its segments.
    pub(crate) fn parse(pattern: &str) -> Result<Vec<&str>, BusError> {
        let invalid = |reason| BusError::InvalidTopic {
            topic: pattern.to_string(),
            reason,
        };
        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }
        let segments: Vec<&str> = pattern.split('/').collect();
        if let Some(pos) = segments.iter().position(|s| *s == MULTI) {
            if pos + 1 != segments.len() {
                return Err(invalid("'#' must be the last segment"));
            }
        }
        Ok(segments)
    }

    /// Appends a subscription at the node addressed by `segments`.
    pub(crate) fn insert(&mut self, segments: &[&str], sub: Subscription) {
        let mut node = self;
        for seg in segments {
            node = node.children.entry((*seg).to_string()).or_default();
        }
        node.subs.get_or_insert_with(Vec::new).push(sub);
    }

    /// Removes the subscription with handler identity `id` from the node at `segments`.
    ///
    /// Returns `true` if it was found. Prunes nodes emptied by the removal.
    pub(crate) fn remove(&mut self, segments: &[&str], id: usize) -> bool {
        match segments.split_first() {
            None => {
                let Some(list) = self.subs.as_mut() else {
                    return false;
                };
                let before = list.len();
                list.retain(|s| s.id() != id);
                let removed = list.len() != before;
                if list.is_empty() {
                    self.subs = None;
                }
                removed
            }
            Some((head, rest)) => {
                let Some(child) = self.children.get_mut(*head) else {
                    return false;
                };
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.children.remove(*head);
                }
                removed
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.subs.is_none() && self.children.is_empty()
    }

    /// Collects every subscription matching the concrete `topic`.
    ///
    /// `once` subscriptions are taken out of the trie as they are collected; their
    /// handler ids are appended to `fired_once` so the caller can update its index.
    /// When `reserved` is set and the topic starts with it, root-level wildcards are
    /// skipped.
    pub(crate) fn collect(
        &mut self,
        topic: &str,
        reserved: Option<char>,
        fired_once: &mut Vec<usize>,
    ) -> Vec<Subscription> {
        let segments: Vec<&str> = topic.split('/').collect();
        let normal = reserved.is_none_or(|p| !topic.starts_with(p));
        let mut out = Vec::new();
        self.walk(&segments, 0, normal, &mut out, fired_once);
        out
    }

    fn walk(
        &mut self,
        segments: &[&str],
        depth: usize,
        normal: bool,
        out: &mut Vec<Subscription>,
        fired_once: &mut Vec<usize>,
    ) {
        let wildcards = normal || depth > 0;

        if depth == segments.len() {
            self.take_matches(out, fired_once);
        } else {
            let part = segments[depth];
            if part != SINGLE && part != MULTI {
                Self::descend(&mut self.children, part, segments, depth, normal, out, fired_once);
            }
            if wildcards {
                Self::descend(&mut self.children, SINGLE, segments, depth, normal, out, fired_once);
            }
        }

        if wildcards {
            if let Some(child) = self.children.get_mut(MULTI) {
                child.take_matches(out, fired_once);
                if child.is_empty() {
                    self.children.remove(MULTI);
                }
            }
        }
    }

    fn descend(
        children: &mut HashMap<String, Node>,
        key: &str,
        segments: &[&str],
        depth: usize,
        normal: bool,
        out: &mut Vec<Subscription>,
        fired_once: &mut Vec<usize>,
    ) {
        if let Some(child) = children.get_mut(key) {
            child.walk(segments, depth + 1, normal, out, fired_once);
            if child.is_empty() {
                children.remove(key);
            }
        }
    }

    /// Copies this node's subscriptions into `out`, dropping `once` entries.
    fn take_matches(&mut self, out: &mut Vec<Subscription>, fired_once: &mut Vec<usize>) {
        let Some(list) = self.subs.as_mut() else {
            return;
        };
        out.extend(list.iter().cloned());
        list.retain(|s| {
            if s.once {
                fired_once.push(s.id());
            }
            !s.once
        });
        if list.is_empty() {
            self.subs = None;
        }
    }

    /// Depth-first dump of every subscription.
    pub(crate) fn visit<'a>(&'a self, out: &mut Vec<&'a Subscription>) {
        if let Some(list) = &self.subs {
            out.extend(list.iter());
        }
        for child in self.children.values() {
            child.visit(out);
        }
    }
}
