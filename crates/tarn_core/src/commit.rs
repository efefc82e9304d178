//! Commit hooks: validation and rewriting of merged trees.

use crate::error::{CoreError, CoreResult};
use crate::node::{NodeState, CONFLICT_NAME};

/// Metadata attached to a merge.
#[derive(Debug, Clone, Default)]
pub struct CommitInfo {
    /// Identifier of the committing session or user, if any.
    pub user_id: Option<String>,
    /// Free-form commit message.
    pub message: Option<String>,
}

impl CommitInfo {
    /// Creates an empty commit info.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// A hook run against the rebased tree while a merge holds the right to
/// move the head.
///
/// The hook may validate the tree, rewrite it, or reject the commit by
/// returning an error, which aborts the merge without moving the head.
pub trait CommitHook: Send + Sync {
    /// Processes a commit, returning the tree that will actually be
    /// committed.
    ///
    /// # Errors
    ///
    /// An error rejects the commit and aborts the merge.
    fn process_commit(
        &self,
        before: &NodeState,
        after: NodeState,
        info: &CommitInfo,
    ) -> CoreResult<NodeState>;
}

/// A hook that passes every commit through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyHook;

impl CommitHook for EmptyHook {
    fn process_commit(
        &self,
        _before: &NodeState,
        after: NodeState,
        _info: &CommitInfo,
    ) -> CoreResult<NodeState> {
        Ok(after)
    }
}

/// A hook that rejects commits carrying unresolved conflict
/// annotations.
///
/// Only subtrees that actually changed relative to `before` are
/// descended into, so validation cost is proportional to the size of
/// the change, not the size of the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictValidator;

impl CommitHook for ConflictValidator {
    fn process_commit(
        &self,
        before: &NodeState,
        after: NodeState,
        _info: &CommitInfo,
    ) -> CoreResult<NodeState> {
        validate(Some(before), &after)?;
        Ok(after)
    }
}

fn validate(before: Option<&NodeState>, after: &NodeState) -> CoreResult<()> {
    if let Some(before) = before {
        if before == after {
            return Ok(());
        }
    }
    if after.has_child(CONFLICT_NAME) {
        return Err(CoreError::commit_failed(format!(
            "unresolved conflict at {}",
            after.record_id()
        )));
    }

    let names: Vec<String> = after.child_names().map(str::to_string).collect();
    for name in names {
        let after_child = match after.child(&name)? {
            Some(child) => child,
            None => continue,
        };
        let before_child = match before {
            Some(before) => before.child(&name)?,
            None => None,
        };
        validate(before_child.as_ref(), &after_child)?;
    }
    Ok(())
}
