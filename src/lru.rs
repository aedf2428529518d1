//! Least-recently-used ordering of record locations.
//!
//! A doubly linked list over a slab arena: node handles are indices into
//! the arena, every operation is O(1) and no raw pointers are involved.
//! The list stores locations rather than record handles; the cache resolves
//! them through its buckets.

use slab::Slab;

use crate::key::Location;

/// Handle to a list node, stable until the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef(usize);

struct Node {
    loc: Location,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list with the most recently used location at the front.
#[derive(Default)]
pub(crate) struct LruList {
    nodes: Slab<Node>,
    front: Option<usize>,
    back: Option<usize>,
}

impl LruList {
    /// Insert a location at the front; returns its node handle.
    pub(crate) fn push_front(&mut self, loc: Location) -> NodeRef {
        let idx = self.nodes.insert(Node {
            loc,
            prev: None,
            next: self.front,
        });
        match self.front {
            Some(old) => self.nodes[old].prev = Some(idx),
            None => self.back = Some(idx),
        }
        self.front = Some(idx);
        NodeRef(idx)
    }

    /// Move an existing node to the front.
    pub(crate) fn move_to_front(&mut self, node: NodeRef) {
        if self.front == Some(node.0) {
            return;
        }
        self.unlink(node.0);
        self.nodes[node.0].prev = None;
        self.nodes[node.0].next = self.front;
        match self.front {
            Some(old) => self.nodes[old].prev = Some(node.0),
            None => self.back = Some(node.0),
        }
        self.front = Some(node.0);
    }

    /// Remove a node from the list, invalidating its handle.
    pub(crate) fn remove(&mut self, node: NodeRef) {
        self.unlink(node.0);
        self.nodes.remove(node.0);
    }

    /// The least recently used location, if any.
    pub(crate) fn back(&self) -> Option<&Location> {
        self.back.map(|idx| &self.nodes[idx].loc)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = &self.nodes[idx];
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.front = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.back = prev,
        }
    }

    #[cfg(test)]
    pub(crate) fn location_of(&self, node: NodeRef) -> Option<&Location> {
        self.nodes.get(node.0).map(|node| &node.loc)
    }

    /// Iterate front to back.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeRef, &Location)> {
        let mut next = self.front;
        std::iter::from_fn(move || {
            let idx = next?;
            next = self.nodes[idx].next;
            Some((NodeRef(idx), &self.nodes[idx].loc))
        })
    }
}
