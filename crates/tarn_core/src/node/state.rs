//! Immutable node snapshots.

use crate::error::CoreResult;
use crate::node::{Node, NodeBuilder, PropertyValue};
use crate::store::FileStore;
use crate::types::RecordId;
use std::fmt;
use std::sync::Arc;

/// An immutable view of a node record at a point in time.
///
/// A `NodeState` never changes; navigating to a child yields another
/// `NodeState` and modifying anything goes through a [`NodeBuilder`].
/// Two states are equal when they name the same record, which makes
/// comparing whole subtrees an O(1) identity check.
#[derive(Clone)]
pub struct NodeState {
    id: RecordId,
    node: Arc<Node>,
    store: Arc<FileStore>,
}

impl NodeState {
    /// Reads the node at `id` from the store.
    ///
    /// # Errors
    ///
    /// Fails if the segment cannot be found or the record is corrupt.
    pub fn read(store: Arc<FileStore>, id: RecordId) -> CoreResult<Self> {
        let node = store.read_node(id)?;
        Ok(Self {
            id,
            node: Arc::new(node),
            store,
        })
    }

    /// Returns the record backing this state.
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        self.id
    }

    /// Returns the value of the named property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.node.property(name)
    }

    /// Returns whether the named child exists.
    #[must_use]
    pub fn has_child(&self, name: &str) -> bool {
        self.node.child(name).is_some()
    }

    /// Navigates to the named child.
    ///
    /// # Errors
    ///
    /// Fails if the child's segment cannot be read.
    pub fn child(&self, name: &str) -> CoreResult<Option<NodeState>> {
        match self.node.child(name) {
            Some(id) => Ok(Some(Self::read(Arc::clone(&self.store), id)?)),
            None => Ok(None),
        }
    }

    /// Returns the child names in order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.node.child_names()
    }

    /// Returns the property names in order.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.node.property_names()
    }

    /// Returns the number of children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.node.child_count()
    }

    /// Starts building a modified version of this node.
    #[must_use]
    pub fn builder(&self) -> NodeBuilder {
        NodeBuilder::from_state(self)
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    pub(crate) fn store(&self) -> &Arc<FileStore> {
        &self.store
    }
}

impl PartialEq for NodeState {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeState {}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}
