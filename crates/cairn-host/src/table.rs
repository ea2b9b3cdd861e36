//! Node table adapter — the Host's view of the discovery subsystem.
//!
//! The discovery protocol itself (the UDP machinery) lives elsewhere; the
//! Host only consumes its event stream and asks it about known nodes. That
//! surface is a trait so tests can drive the Host with a scripted table.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use cairn_core::identity::NodeId;

use crate::node::Node;

/// Discovery events, delivered in arrival order via [`NodeTable::take_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEvent {
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
}

/// The discovery-table surface the Host depends on.
pub trait NodeTable: Send + Sync {
    /// Record a node. Fires a `NodeAdded` event.
    fn add_node(&self, node: Node);

    /// Forget a node. Fires a `NodeRemoved` event.
    fn remove_node(&self, id: &NodeId);

    fn node(&self, id: &NodeId) -> Option<Node>;

    fn has_node(&self, id: &NodeId) -> bool;

    /// Drain queued events. The scheduler pumps this once per tick.
    fn take_events(&self) -> Vec<TableEvent>;
}

/// In-process node table: the stand-in used when no external discovery
/// stack is wired up, and the injection point for tests.
pub struct InMemoryNodeTable {
    /// UDP port discovery would bind to. Kept for parity with the real table.
    #[allow(dead_code)]
    udp_port: u16,
    nodes: Mutex<HashMap<NodeId, Node>>,
    events: Mutex<VecDeque<TableEvent>>,
}

impl InMemoryNodeTable {
    pub fn bound(udp_port: u16) -> Self {
        Self {
            udp_port,
            nodes: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
        }
    }
}

impl NodeTable for InMemoryNodeTable {
    fn add_node(&self, node: Node) {
        if node.id.is_zero() {
            return;
        }
        self.nodes.lock().unwrap().insert(node.id, node);
        self.events
            .lock()
            .unwrap()
            .push_back(TableEvent::NodeAdded(node.id));
    }

    fn remove_node(&self, id: &NodeId) {
        if self.nodes.lock().unwrap().remove(id).is_some() {
            self.events
                .lock()
                .unwrap()
                .push_back(TableEvent::NodeRemoved(*id));
        }
    }

    fn node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.lock().unwrap().get(id).copied()
    }

    fn has_node(&self, id: &NodeId) -> bool {
        self.nodes.lock().unwrap().contains_key(id)
    }

    fn take_events(&self) -> Vec<TableEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{v4, NodeEndpoint};

    fn node(last: u8) -> Node {
        Node::new(
            NodeId::from_bytes([last; 64]),
            NodeEndpoint::new(v4(203, 0, 113, last), 30303, 30303),
        )
    }

    #[test]
    fn events_arrive_in_order() {
        let table = InMemoryNodeTable::bound(30303);
        let (a, b) = (node(1), node(2));

        table.add_node(a);
        table.add_node(b);
        table.remove_node(&a.id);

        assert_eq!(
            table.take_events(),
            vec![
                TableEvent::NodeAdded(a.id),
                TableEvent::NodeAdded(b.id),
                TableEvent::NodeRemoved(a.id),
            ]
        );
        // drained
        assert!(table.take_events().is_empty());
    }

    #[test]
    fn lookup_follows_add_and_remove() {
        let table = InMemoryNodeTable::bound(30303);
        let n = node(7);

        assert!(!table.has_node(&n.id));
        table.add_node(n);
        assert!(table.has_node(&n.id));
        assert_eq!(table.node(&n.id), Some(n));

        table.remove_node(&n.id);
        assert!(!table.has_node(&n.id));
    }

    #[test]
    fn zero_id_nodes_are_ignored() {
        let table = InMemoryNodeTable::bound(30303);
        table.add_node(Node::new(
            NodeId::default(),
            NodeEndpoint::new(v4(203, 0, 113, 1), 30303, 30303),
        ));
        assert!(table.take_events().is_empty());
    }

    #[test]
    fn removing_unknown_node_fires_nothing() {
        let table = InMemoryNodeTable::bound(30303);
        table.remove_node(&NodeId::from_bytes([9; 64]));
        assert!(table.take_events().is_empty());
    }
}
