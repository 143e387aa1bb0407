//! Rumor buffer: facts still being actively disseminated

use crate::node::{Node, NodeId, NodeStatus};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A buffered fact and the number of times it has been piggybacked.
#[derive(Debug, Clone)]
struct Rumor {
    node: Node,
    spread_count: usize,
}

/// Short-lived staging area for membership facts that changed recently.
///
/// Each fact is pushed on outbound messages a bounded number of times before
/// being folded into steady-state membership, which bounds gossip traffic to
/// O(log N) rounds per fact. Selection prefers the least-disseminated facts
/// first.
#[derive(Debug, Default)]
pub struct RumorBuffer {
    rumors: HashMap<NodeId, Rumor>,
}

impl RumorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rumors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rumors.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rumors.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.rumors.get(id).map(|rumor| &rumor.node)
    }

    /// Iterate over buffered facts in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.rumors.values().map(|rumor| &rumor.node)
    }

    /// Stage a fact for dissemination. Returns whether the fact was taken.
    ///
    /// A fact superseding the buffered one replaces it and resets its spread
    /// counter, so a newer change restarts its own dissemination clock. A
    /// fact that does not supersede is ignored.
    pub fn add(&mut self, node: Node) -> bool {
        match self.rumors.get_mut(&node.id) {
            Some(rumor) => {
                if node.supersedes(&rumor.node) {
                    rumor.node = node;
                    rumor.spread_count = 0;
                    true
                } else {
                    false
                }
            }
            None => {
                self.rumors.insert(
                    node.id.clone(),
                    Rumor {
                        node,
                        spread_count: 0,
                    },
                );
                true
            }
        }
    }

    /// Select up to `num` facts to spread, least-disseminated first,
    /// incrementing each selected fact's counter.
    ///
    /// A fact whose counter exceeds `max_spread` after the increment is
    /// removed from the buffer: FAILED facts are dropped silently, all others
    /// are returned in the second list for the caller to fold back into the
    /// member set. If `num` covers the buffer, every entry is visited exactly
    /// once.
    pub fn fetch(&mut self, num: usize, max_spread: usize) -> (Vec<Node>, Vec<Node>) {
        if num == 0 || self.rumors.is_empty() {
            return (Vec::new(), Vec::new());
        }

        if num >= self.rumors.len() {
            return self.fetch_all(max_spread);
        }

        self.fetch_some(num, max_spread)
    }

    fn fetch_all(&mut self, max_spread: usize) -> (Vec<Node>, Vec<Node>) {
        let mut to_spread = Vec::with_capacity(self.rumors.len());
        let mut now_stable = Vec::new();

        self.rumors.retain(|_, rumor| {
            rumor.spread_count += 1;
            if rumor.spread_count > max_spread {
                if rumor.node.status != NodeStatus::Failed {
                    now_stable.push(rumor.node.clone());
                }
                false
            } else {
                to_spread.push(rumor.node.clone());
                true
            }
        });

        (to_spread, now_stable)
    }

    fn fetch_some(&mut self, num: usize, max_spread: usize) -> (Vec<Node>, Vec<Node>) {
        // Min-heap over the current spread counts.
        let mut queue: BinaryHeap<Reverse<(usize, NodeId)>> = self
            .rumors
            .iter()
            .map(|(id, rumor)| Reverse((rumor.spread_count, id.clone())))
            .collect();

        let mut to_spread = Vec::with_capacity(num);
        let mut now_stable = Vec::new();

        while let Some(Reverse((_, id))) = queue.pop() {
            let rumor = self
                .rumors
                .get_mut(&id)
                .expect("heap entry without rumor");
            rumor.spread_count += 1;
            if rumor.spread_count > max_spread {
                let rumor = self.rumors.remove(&id).expect("rumor vanished");
                if rumor.node.status != NodeStatus::Failed {
                    now_stable.push(rumor.node);
                }
            } else {
                to_spread.push(rumor.node.clone());
                if to_spread.len() == num {
                    break;
                }
            }
        }

        (to_spread, now_stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, version: u64) -> Node {
        Node::new(id, "127.0.0.1:7946".parse().unwrap(), version)
    }

    #[test]
    fn test_spread_exactly_k_times_then_stable() {
        let mut buffer = RumorBuffer::new();
        buffer.add(node("n1", 1));

        let k = 3;
        for round in 0..k {
            let (to_spread, now_stable) = buffer.fetch(10, k);
            assert_eq!(to_spread.len(), 1, "round {}", round);
            assert_eq!(to_spread[0].id, "n1");
            assert!(now_stable.is_empty());
        }

        // (k+1)-th selection stabilizes the fact and removes it.
        let (to_spread, now_stable) = buffer.fetch(10, k);
        assert!(to_spread.is_empty());
        assert_eq!(now_stable.len(), 1);
        assert_eq!(now_stable[0], node("n1", 1));
        assert!(buffer.is_empty());

        let (to_spread, now_stable) = buffer.fetch(10, k);
        assert!(to_spread.is_empty() && now_stable.is_empty());
    }

    #[test]
    fn test_failed_facts_dropped_not_stabilized() {
        let mut buffer = RumorBuffer::new();
        buffer.add(node("n1", 1).with_status(NodeStatus::Failed));

        for _ in 0..2 {
            let (to_spread, _) = buffer.fetch(10, 2);
            assert_eq!(to_spread.len(), 1);
        }

        let (to_spread, now_stable) = buffer.fetch(10, 2);
        assert!(to_spread.is_empty());
        assert!(now_stable.is_empty(), "FAILED facts are dropped silently");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_superseding_add_resets_counter() {
        let mut buffer = RumorBuffer::new();
        buffer.add(node("n1", 1));
        buffer.fetch(10, 5);
        buffer.fetch(10, 5);

        // A newer fact restarts dissemination.
        buffer.add(node("n1", 2));

        // 5 more spread rounds before stabilizing, not 3.
        for _ in 0..5 {
            let (to_spread, _) = buffer.fetch(10, 5);
            assert_eq!(to_spread.len(), 1);
            assert_eq!(to_spread[0].version, 2);
        }
        let (_, now_stable) = buffer.fetch(10, 5);
        assert_eq!(now_stable.len(), 1);
    }

    #[test]
    fn test_stale_add_is_ignored() {
        let mut buffer = RumorBuffer::new();
        assert!(buffer.add(node("n1", 2)));
        buffer.fetch(10, 5);

        assert!(!buffer.add(node("n1", 1)));

        let (to_spread, _) = buffer.fetch(10, 5);
        assert_eq!(to_spread[0].version, 2);
    }

    #[test]
    fn test_least_spread_selected_first() {
        let mut buffer = RumorBuffer::new();
        buffer.add(node("old", 1));
        // Spread "old" twice before "new" shows up.
        buffer.fetch(10, 10);
        buffer.fetch(10, 10);
        buffer.add(node("new", 1));

        let (to_spread, _) = buffer.fetch(1, 10);
        assert_eq!(to_spread.len(), 1);
        assert_eq!(to_spread[0].id, "new");
        assert!(buffer.contains("old"));
    }

    #[test]
    fn test_partial_fetch_drains_fully_exhausted_buffer() {
        let mut buffer = RumorBuffer::new();
        buffer.add(node("a", 1));
        buffer.add(node("b", 1));
        buffer.add(node("c", 1));
        // Bring everything to the max spread count.
        buffer.fetch(10, 1);

        // Even a request for one entry stabilizes every entry it visits
        // while hunting for something left to spread.
        let (to_spread, now_stable) = buffer.fetch(1, 1);
        assert!(to_spread.is_empty());
        assert_eq!(now_stable.len(), 3);
        assert!(buffer.is_empty());
    }
}
