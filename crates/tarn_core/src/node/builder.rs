//! Mutable staging area for building new node records.

use crate::error::CoreResult;
use crate::node::{Node, NodeState, PropertyValue, INLINE_BINARY_MAX};
use crate::store::FileStore;
use crate::types::RecordId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A child entry under construction: either an untouched reference into
/// the existing segment graph, or a nested builder with pending changes.
#[derive(Debug)]
enum ChildSlot {
    Existing(RecordId),
    Staged(Box<NodeBuilder>),
}

/// A mutable builder over a node record.
///
/// Changes accumulate in memory; nothing touches the store until
/// [`write`](NodeBuilder::write), which persists the modified subtree
/// bottom-up and returns the new snapshot. Untouched children stay as
/// record references and are shared with the previous snapshot.
#[derive(Debug)]
pub struct NodeBuilder {
    store: Arc<FileStore>,
    properties: BTreeMap<String, PropertyValue>,
    children: BTreeMap<String, ChildSlot>,
}

impl NodeBuilder {
    /// Creates a builder for a brand new empty node.
    #[must_use]
    pub fn new(store: Arc<FileStore>) -> Self {
        Self {
            store,
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub(crate) fn from_state(state: &NodeState) -> Self {
        Self::from_node(Arc::clone(state.store()), state.node())
    }

    pub(crate) fn from_node(store: Arc<FileStore>, node: &Node) -> Self {
        let children = node
            .children
            .iter()
            .map(|(name, id)| (name.clone(), ChildSlot::Existing(*id)))
            .collect();
        Self {
            store,
            properties: node.properties.clone(),
            children,
        }
    }

    /// Sets a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: PropertyValue) -> &mut Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Removes a property. Removing an absent property is a no-op.
    pub fn remove_property(&mut self, name: &str) -> &mut Self {
        self.properties.remove(name);
        self
    }

    /// Returns the staged value of the named property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Returns whether the named child exists in the staged tree.
    #[must_use]
    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    /// Returns a nested builder for the named child, creating the child
    /// if it does not exist yet.
    ///
    /// An existing child is loaded from the store the first time it is
    /// opened for modification.
    ///
    /// # Errors
    ///
    /// Fails if an existing child's segment cannot be read.
    pub fn child(&mut self, name: impl Into<String>) -> CoreResult<&mut NodeBuilder> {
        let name = name.into();
        if let Some(ChildSlot::Existing(id)) = self.children.get(&name) {
            let node = self.store.read_node(*id)?;
            let staged = Self::from_node(Arc::clone(&self.store), &node);
            self.children
                .insert(name.clone(), ChildSlot::Staged(Box::new(staged)));
        }
        let slot = self
            .children
            .entry(name)
            .or_insert_with(|| ChildSlot::Staged(Box::new(Self::new(Arc::clone(&self.store)))));
        match slot {
            ChildSlot::Staged(builder) => Ok(builder),
            ChildSlot::Existing(_) => unreachable!("existing child was staged above"),
        }
    }

    /// Replaces the named child with a reference to an already persisted
    /// subtree.
    pub fn set_child_id(&mut self, name: impl Into<String>, id: RecordId) -> &mut Self {
        self.children.insert(name.into(), ChildSlot::Existing(id));
        self
    }

    /// Removes a child. Removing an absent child is a no-op.
    pub fn remove_child(&mut self, name: &str) -> &mut Self {
        self.children.remove(name);
        self
    }

    /// Returns the staged child names in order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Persists the staged subtree and returns the new snapshot.
    ///
    /// Children are written bottom-up so every record reference points at
    /// an already written record. Inline binaries at or above the inline
    /// threshold are spilled to bulk segments here.
    ///
    /// # Errors
    ///
    /// Fails if any record cannot be appended to the store.
    pub fn write(&self) -> CoreResult<NodeState> {
        let id = self.write_subtree()?;
        NodeState::read(Arc::clone(&self.store), id)
    }

    pub(crate) fn write_subtree(&self) -> CoreResult<RecordId> {
        let mut node = Node::empty();

        for (name, value) in &self.properties {
            let value = match value {
                PropertyValue::Binary(bytes) if bytes.len() >= INLINE_BINARY_MAX => {
                    let id = self.store.write_blob(bytes)?;
                    PropertyValue::BinaryRef {
                        id,
                        len: bytes.len() as u64,
                    }
                }
                other => other.clone(),
            };
            node.set_property(name.clone(), value);
        }

        for (name, slot) in &self.children {
            let id = match slot {
                ChildSlot::Existing(id) => *id,
                ChildSlot::Staged(builder) => builder.write_subtree()?,
            };
            node.set_child(name.clone(), id);
        }

        self.store.write_node(&node)
    }
}
