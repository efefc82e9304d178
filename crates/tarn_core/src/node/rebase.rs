//! Rebasing one snapshot's changes onto another.
//!
//! `rebase_node` computes the difference between a branch head and its
//! base and replays it on top of another snapshot. Changes that touch
//! disjoint parts of the tree merge cleanly; colliding changes are kept,
//! annotated under a `:conflict` child so a later commit hook or the
//! application can resolve them.

use crate::error::CoreResult;
use crate::node::{Node, PropertyValue};
use crate::store::FileStore;
use crate::types::RecordId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the child node carrying conflict annotations.
pub const CONFLICT_NAME: &str = ":conflict";

/// Replays the changes between `base` and `head` on top of `onto`,
/// returning the record id of the merged tree.
///
/// Additions on both sides under the same name are merged recursively,
/// so two branches each adding a different child below the same new
/// node converge to the union. Genuine collisions (the same property
/// changed to different values, a changed subtree deleted) survive the
/// rebase annotated under [`CONFLICT_NAME`].
///
/// # Errors
///
/// Fails if any involved record cannot be read or the merged records
/// cannot be written.
pub(crate) fn rebase_node(
    store: &Arc<FileStore>,
    base: RecordId,
    head: RecordId,
    onto: RecordId,
) -> CoreResult<RecordId> {
    if head == base {
        return Ok(onto);
    }
    if onto == base || onto == head {
        return Ok(head);
    }

    let base_node = store.read_node(base)?;
    let head_node = store.read_node(head)?;
    let onto_node = store.read_node(onto)?;
    merge_nodes(store, Some(&base_node), &head_node, &onto_node)
}

/// Merges the changes `base -> head` into `onto` and writes the result.
/// A `base` of `None` means both `head` and `onto` were added fresh.
fn merge_nodes(
    store: &Arc<FileStore>,
    base: Option<&Node>,
    head: &Node,
    onto: &Node,
) -> CoreResult<RecordId> {
    let empty = Node::empty();
    let base = base.unwrap_or(&empty);

    let mut merged = onto.clone();
    let mut conflicts = Conflicts::default();

    for (name, head_value) in &head.properties {
        let base_value = base.properties.get(name);
        let onto_value = onto.properties.get(name);

        if base_value == Some(head_value) {
            continue;
        }

        match base_value {
            // Added on our side.
            None => match onto_value {
                None => {
                    merged.set_property(name.clone(), head_value.clone());
                }
                Some(v) if v == head_value => {}
                Some(_) => conflicts.property("addExistingProperty", name, head_value),
            },
            // Changed on our side.
            Some(base_value) => match onto_value {
                Some(v) if v == base_value => {
                    merged.set_property(name.clone(), head_value.clone());
                }
                Some(v) if v == head_value => {}
                Some(_) => conflicts.property("changeChangedProperty", name, head_value),
                None => conflicts.property("changeDeletedProperty", name, head_value),
            },
        }
    }

    // Deletions on our side. A property deleted on both sides converges
    // without a conflict.
    for (name, base_value) in &base.properties {
        if head.properties.contains_key(name) {
            continue;
        }
        match onto.properties.get(name) {
            Some(v) if v == base_value => {
                merged.properties.remove(name);
            }
            Some(v) => conflicts.property("deleteChangedProperty", name, v),
            None => {}
        }
    }

    for (name, head_child) in &head.children {
        let base_child = base.children.get(name);
        let onto_child = onto.children.get(name);

        if base_child == Some(head_child) {
            continue;
        }

        match base_child {
            // Added on our side.
            None => match onto_child {
                None => {
                    merged.set_child(name.clone(), *head_child);
                }
                Some(o) if o == head_child => {}
                Some(o) => {
                    // Added on both sides: merge the two additions as if
                    // rebasing onto an empty base, so disjoint subtrees
                    // union instead of conflicting.
                    let head_node = store.read_node(*head_child)?;
                    let onto_node = store.read_node(*o)?;
                    let merged_child = merge_nodes(store, None, &head_node, &onto_node)?;
                    merged.set_child(name.clone(), merged_child);
                }
            },
            // Changed on our side.
            Some(base_child) => match onto_child {
                Some(o) if o == base_child => {
                    merged.set_child(name.clone(), *head_child);
                }
                Some(o) if o == head_child => {}
                Some(o) => {
                    let merged_child = rebase_node(store, *base_child, *head_child, *o)?;
                    merged.set_child(name.clone(), merged_child);
                }
                None => conflicts.child("changeDeletedNode", name, *head_child),
            },
        }
    }

    // Child deletions on our side.
    for (name, base_child) in &base.children {
        if head.children.contains_key(name) {
            continue;
        }
        match onto.children.get(name) {
            Some(o) if o == base_child => {
                merged.children.remove(name);
            }
            Some(o) => conflicts.child("deleteChangedNode", name, *o),
            None => {}
        }
    }

    if !conflicts.is_empty() {
        let conflict_id = conflicts.write(store)?;
        merged.set_child(CONFLICT_NAME, conflict_id);
    }

    store.write_node(&merged)
}

/// Conflict annotations collected while merging one node, grouped by
/// conflict kind.
#[derive(Default)]
struct Conflicts {
    kinds: BTreeMap<&'static str, Node>,
}

impl Conflicts {
    fn property(&mut self, kind: &'static str, name: &str, value: &PropertyValue) {
        self.kinds
            .entry(kind)
            .or_default()
            .set_property(name.to_string(), value.clone());
    }

    fn child(&mut self, kind: &'static str, name: &str, id: RecordId) {
        self.kinds
            .entry(kind)
            .or_default()
            .set_child(name.to_string(), id);
    }

    fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn write(&self, store: &Arc<FileStore>) -> CoreResult<RecordId> {
        let mut root = Node::empty();
        for (kind, node) in &self.kinds {
            let id = store.write_node(node)?;
            root.set_child((*kind).to_string(), id);
        }
        store.write_node(&root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::node::NodeState;
    use crate::store::FileStore;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> Arc<FileStore> {
        FileStore::open(dir, Config::default()).unwrap()
    }

    /// Writes `root/{child}` and returns the new root's record id.
    fn add_child(store: &Arc<FileStore>, root: RecordId, path: &[&str]) -> RecordId {
        let state = NodeState::read(Arc::clone(store), root).unwrap();
        let mut builder = state.builder();
        {
            let mut cursor = &mut builder;
            for name in path {
                cursor = cursor.child(*name).unwrap();
            }
        }
        builder.write().unwrap().record_id()
    }

    #[test]
    fn disjoint_subtree_additions_union() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let base = store.head();

        // Both sides add a child under the same freshly added node "a".
        let ours = add_child(&store, base, &["a", "b"]);
        let theirs = add_child(&store, base, &["a", "c"]);

        let merged = rebase_node(&store, base, ours, theirs).unwrap();
        let merged = NodeState::read(Arc::clone(&store), merged).unwrap();
        let a = merged.child("a").unwrap().unwrap();
        assert!(a.has_child("b"));
        assert!(a.has_child("c"));
        assert!(!merged.has_child(CONFLICT_NAME));
    }

    #[test]
    fn unchanged_head_rebases_to_onto() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let base = store.head();
        let theirs = add_child(&store, base, &["x"]);

        assert_eq!(rebase_node(&store, base, base, theirs).unwrap(), theirs);
    }

    #[test]
    fn property_change_applies_onto_moved_head() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let base = store.head();

        let base_state = NodeState::read(Arc::clone(&store), base).unwrap();
        let mut builder = base_state.builder();
        builder.set_property("color", PropertyValue::string("red"));
        let ours = builder.write().unwrap().record_id();

        let theirs = add_child(&store, base, &["other"]);

        let merged = rebase_node(&store, base, ours, theirs).unwrap();
        let merged = NodeState::read(Arc::clone(&store), merged).unwrap();
        assert_eq!(
            merged.property("color"),
            Some(&PropertyValue::string("red"))
        );
        assert!(merged.has_child("other"));
    }

    #[test]
    fn conflicting_property_change_annotated() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let base_id = store.head();
        let base = NodeState::read(Arc::clone(&store), base_id).unwrap();

        let mut ours = base.builder();
        ours.set_property("color", PropertyValue::string("red"));
        let ours = ours.write().unwrap().record_id();

        let mut theirs = base.builder();
        theirs.set_property("color", PropertyValue::string("blue"));
        let theirs = theirs.write().unwrap().record_id();

        let merged = rebase_node(&store, base_id, ours, theirs).unwrap();
        let merged = NodeState::read(Arc::clone(&store), merged).unwrap();

        // Their value survives; ours is kept under the annotation.
        assert_eq!(
            merged.property("color"),
            Some(&PropertyValue::string("blue"))
        );
        let conflict = merged.child(CONFLICT_NAME).unwrap().unwrap();
        let kind = conflict.child("addExistingProperty").unwrap().unwrap();
        assert_eq!(kind.property("color"), Some(&PropertyValue::string("red")));
    }

    #[test]
    fn delete_changed_node_annotated() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let base = add_child(&store, store.head(), &["doomed"]);

        // We delete "doomed"; they change it.
        let base_state = NodeState::read(Arc::clone(&store), base).unwrap();
        let mut ours = base_state.builder();
        ours.remove_child("doomed");
        let ours = ours.write().unwrap().record_id();

        let theirs = add_child(&store, base, &["doomed", "kept"]);

        let merged = rebase_node(&store, base, ours, theirs).unwrap();
        let merged = NodeState::read(Arc::clone(&store), merged).unwrap();
        let conflict = merged.child(CONFLICT_NAME).unwrap().unwrap();
        assert!(conflict.child("deleteChangedNode").unwrap().unwrap().has_child("doomed"));
    }
}
