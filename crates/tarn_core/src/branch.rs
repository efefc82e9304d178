//! Private branches and the merge protocol.
//!
//! A branch captures the root at a point in time and accumulates local
//! changes against it. Merging replays those changes onto whatever the
//! head has become and races a compare-and-set against other writers:
//! first optimistically with exponential backoff, then pessimistically
//! under an advisory lock written into the super root itself, so the
//! lock is recovered like any other state after a crash.

use crate::commit::{CommitHook, CommitInfo};
use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::node::{rebase_node, Node, NodeState, PropertyValue};
use crate::store::FileStore;
use crate::types::RecordId;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};
use uuid::Uuid;

/// Super root property naming the current pessimistic lock holder.
const TOKEN_NAME: &str = "token";
/// Super root property holding the lock expiry in milliseconds since
/// the epoch. An expired lock is free to take.
const TIMEOUT_NAME: &str = "timeout";

/// Name of the super root child carrying the user tree.
const ROOT_NAME: &str = "root";

/// First backoff of the optimistic merge phase.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
/// Longest a pessimistic round waits for the head to move before
/// re-checking the lock.
const MAX_LOCK_WAIT: Duration = Duration::from_secs(1);
/// Shortest lock lease a pessimistic merge will write for itself.
const MIN_LOCK_LEASE: Duration = Duration::from_millis(100);
/// Pessimistic acquisition rounds before the merge gives up.
const PESSIMISTIC_ATTEMPT_LIMIT: u32 = 100;

/// A private line of development against the store.
///
/// Branch state is plain data; nothing is shared until
/// [`merge`](Branch::merge) succeeds, and a dropped branch simply
/// leaves unreachable records behind.
pub struct Branch {
    store: Arc<FileStore>,
    journal: Journal,
    /// Super root snapshot the branch is based on.
    base_super: RecordId,
    /// User root under `base_super`.
    base_root: RecordId,
    /// User root carrying the branch's local changes.
    head_root: RecordId,
}

impl Branch {
    /// Creates a branch off the current head.
    ///
    /// # Errors
    ///
    /// Fails if the head's super root cannot be read.
    pub fn new(store: Arc<FileStore>) -> CoreResult<Self> {
        let journal = store.journal();
        let base_super = journal.head();
        let base_root = root_of(&store, base_super)?;
        Ok(Self {
            store,
            journal,
            base_super,
            base_root,
            head_root: base_root,
        })
    }

    /// Returns the branch's current root.
    ///
    /// # Errors
    ///
    /// Fails if the root record cannot be read.
    pub fn root(&self) -> CoreResult<NodeState> {
        NodeState::read(Arc::clone(&self.store), self.head_root)
    }

    /// Returns whether the branch carries local changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.head_root != self.base_root
    }

    /// Replaces the branch root with an already persisted state.
    pub fn set_root(&mut self, root: &NodeState) {
        self.head_root = root.record_id();
    }

    /// Rebases the branch's local changes onto the current head.
    ///
    /// A no-op when the head has not moved since the branch's base; in
    /// particular it writes nothing in that case.
    ///
    /// # Errors
    ///
    /// Fails if involved records cannot be read or written.
    pub fn rebase(&mut self) -> CoreResult<()> {
        let current_super = self.journal.head();
        if current_super == self.base_super {
            return Ok(());
        }

        let new_root = root_of(&self.store, current_super)?;
        self.head_root = rebase_node(&self.store, self.base_root, self.head_root, new_root)?;
        self.base_root = new_root;
        self.base_super = current_super;
        Ok(())
    }

    /// Merges the branch into the head and returns the new root.
    ///
    /// The merge first races optimistically: rebase, run the hook, and
    /// try to compare-and-set the head, backing off exponentially from
    /// one millisecond after every lost race. Every round replays the
    /// branch's changes from its original base, so a lost round's
    /// rebase never compounds into the next one. Rounds where another
    /// merge holds an unexpired pessimistic lock skip the attempt and
    /// just wait. Once the backoff would exceed the configured maximum
    /// the merge falls back to the pessimistic protocol, using its
    /// longest optimistic round as the lock lease to request.
    ///
    /// On success the branch is reset onto the new head and can keep
    /// being used.
    ///
    /// # Errors
    ///
    /// Propagates hook rejections as `CommitFailed` and gives up with
    /// `MergeAborted` if the pessimistic phase exhausts its attempts.
    pub fn merge(&mut self, hook: &dyn CommitHook, info: &CommitInfo) -> CoreResult<NodeState> {
        if !self.has_changes() {
            self.rebase()?;
            return self.root();
        }

        let maximum_backoff = self.store.config().maximum_backoff;
        let mut backoff = INITIAL_BACKOFF;
        let mut longest_round = Duration::ZERO;
        let snapshot = self.snapshot();

        while backoff <= maximum_backoff {
            let round = Instant::now();

            self.rebase()?;
            let super_node = self.store.read_node(self.base_super)?;

            if !lock_unexpired(&super_node) {
                match self.try_commit(&super_node, hook, info) {
                    Ok(Some(root)) => return Ok(root),
                    Ok(None) => trace!(backoff = ?backoff, "lost the head race"),
                    Err(err) => {
                        self.restore(snapshot);
                        return Err(err);
                    }
                }
            } else {
                trace!(backoff = ?backoff, "head is locked, skipping attempt");
            }

            let wait = backoff + jitter(backoff);
            self.journal.wait_for_head_change(self.base_super, wait);

            longest_round = longest_round.max(round.elapsed());
            backoff *= 2;

            // The next round replays the local changes from the
            // original base; this round's rebase is discarded.
            self.restore(snapshot);
        }

        debug!(lease = ?longest_round, "optimistic merge exhausted, going pessimistic");
        self.merge_pessimistic(hook, info, longest_round.max(MIN_LOCK_LEASE))
    }

    /// One optimistic commit attempt on top of `super_node`, the
    /// decoded super root at `self.base_super`. Returns `None` if the
    /// head moved underneath the compare-and-set.
    fn try_commit(
        &mut self,
        super_node: &Node,
        hook: &dyn CommitHook,
        info: &CommitInfo,
    ) -> CoreResult<Option<NodeState>> {
        let before = NodeState::read(Arc::clone(&self.store), self.base_root)?;
        let after = NodeState::read(Arc::clone(&self.store), self.head_root)?;
        let merged = hook.process_commit(&before, after, info)?;

        let mut new_super = super_node.clone();
        // An expired lock may still be written into this super root;
        // committing over it clears it.
        new_super.remove_property(TOKEN_NAME);
        new_super.remove_property(TIMEOUT_NAME);
        new_super.set_child(ROOT_NAME, merged.record_id());
        let new_super_id = self.store.write_node(&new_super)?;

        if self.journal.set_head(self.base_super, new_super_id) {
            self.reset_onto(new_super_id, merged.record_id());
            return Ok(Some(merged));
        }
        Ok(None)
    }

    /// The pessimistic protocol: acquire an advisory lock by moving the
    /// head to a super root carrying a lock token, commit on top of it,
    /// and release the lock with the final compare-and-set.
    fn merge_pessimistic(
        &mut self,
        hook: &dyn CommitHook,
        info: &CommitInfo,
        lease: Duration,
    ) -> CoreResult<NodeState> {
        let snapshot = self.snapshot();

        for _ in 0..PESSIMISTIC_ATTEMPT_LIMIT {
            let head_super = self.journal.head();
            let super_node = self.store.read_node(head_super)?;

            if lock_unexpired(&super_node) {
                // Someone else holds the lock; wait out at most a
                // second of their lease and re-check.
                let remaining = lock_remaining(&super_node).min(MAX_LOCK_WAIT);
                self.journal
                    .wait_for_head_change(head_super, remaining + jitter(remaining));
                continue;
            }

            let token = Uuid::new_v4().to_string();
            let expires = now_millis() + lease.as_millis() as i64;
            let mut locked = super_node.clone();
            locked.set_property(TOKEN_NAME, PropertyValue::string(&token));
            locked.set_property(TIMEOUT_NAME, PropertyValue::Long(expires));
            let locked_id = self.store.write_node(&locked)?;

            if !self.journal.set_head(head_super, locked_id) {
                continue;
            }
            debug!(%token, "acquired merge lock");

            match self.commit_locked(&locked, locked_id, hook, info) {
                Ok(Some(root)) => return Ok(root),
                // The lease expired and the lock was broken before the
                // final compare-and-set; start over from the original
                // base and head.
                Ok(None) => {
                    self.restore(snapshot);
                    continue;
                }
                Err(err) => {
                    self.restore(snapshot);
                    // Roll the lock back so others do not have to wait
                    // out the lease. If the rollback race is lost the
                    // lock expires on its own.
                    let unlock_id = self.store.write_node(&super_node)?;
                    let _ = self.journal.set_head(locked_id, unlock_id);
                    return Err(err);
                }
            }
        }

        Err(CoreError::merge_aborted(
            "could not acquire the merge lock after repeated attempts",
        ))
    }

    /// Commits while holding the lock at `locked_id`. The final
    /// compare-and-set both publishes the merge and releases the lock;
    /// `None` means the lock was broken before it landed.
    fn commit_locked(
        &mut self,
        locked: &Node,
        locked_id: RecordId,
        hook: &dyn CommitHook,
        info: &CommitInfo,
    ) -> CoreResult<Option<NodeState>> {
        self.rebase()?;

        let before = NodeState::read(Arc::clone(&self.store), self.base_root)?;
        let after = NodeState::read(Arc::clone(&self.store), self.head_root)?;
        let merged = hook.process_commit(&before, after, info)?;

        let mut final_super = locked.clone();
        final_super.remove_property(TOKEN_NAME);
        final_super.remove_property(TIMEOUT_NAME);
        final_super.set_child(ROOT_NAME, merged.record_id());
        let final_id = self.store.write_node(&final_super)?;

        if self.journal.set_head(locked_id, final_id) {
            self.reset_onto(final_id, merged.record_id());
            Ok(Some(merged))
        } else {
            // Only the lock holder commits on top of the locked super
            // root, so this means the lease expired and was broken.
            debug!("merge lock expired mid-commit, retrying");
            Ok(None)
        }
    }

    fn reset_onto(&mut self, new_super: RecordId, new_root: RecordId) {
        self.base_super = new_super;
        self.base_root = new_root;
        self.head_root = new_root;
    }

    /// Captures the branch's base and head for a later
    /// [`restore`](Branch::restore).
    fn snapshot(&self) -> (RecordId, RecordId, RecordId) {
        (self.base_super, self.base_root, self.head_root)
    }

    /// Rewinds the branch to a previously captured base and head,
    /// discarding any rebase done since.
    fn restore(&mut self, (base_super, base_root, head_root): (RecordId, RecordId, RecordId)) {
        self.base_super = base_super;
        self.base_root = base_root;
        self.head_root = head_root;
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("base", &self.base_root)
            .field("head", &self.head_root)
            .finish()
    }
}

fn root_of(store: &Arc<FileStore>, super_id: RecordId) -> CoreResult<RecordId> {
    store
        .read_node(super_id)?
        .child(ROOT_NAME)
        .ok_or_else(|| CoreError::segment_corruption(format!("super root {super_id} has no root")))
}

/// Returns whether the super root carries a lock that has not expired.
fn lock_unexpired(super_node: &Node) -> bool {
    super_node.property(TOKEN_NAME).is_some() && lock_remaining(super_node) > Duration::ZERO
}

/// Time until the super root's lock expires, zero if absent or expired.
fn lock_remaining(super_node: &Node) -> Duration {
    match super_node.property(TIMEOUT_NAME) {
        Some(PropertyValue::Long(expires)) => {
            let remaining = expires - now_millis();
            if remaining > 0 {
                Duration::from_millis(remaining as u64)
            } else {
                Duration::ZERO
            }
        }
        _ => Duration::ZERO,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Uniform random fraction of `base`, to spread out retries from
/// lockstep contenders.
fn jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64 / 2;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::EmptyHook;
    use crate::config::Config;
    use crate::node::CONFLICT_NAME;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> Arc<FileStore> {
        FileStore::open(dir, Config::default()).unwrap()
    }

    #[test]
    fn fresh_branch_has_no_changes() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let branch = Branch::new(store).unwrap();
        assert!(!branch.has_changes());
    }

    #[test]
    fn merge_publishes_changes() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let mut branch = Branch::new(Arc::clone(&store)).unwrap();
        let root = branch.root().unwrap();
        let mut builder = root.builder();
        builder.set_property("greeting", PropertyValue::string("hello"));
        branch.set_root(&builder.write().unwrap());

        let merged = branch.merge(&EmptyHook, &CommitInfo::new()).unwrap();
        assert_eq!(
            merged.property("greeting"),
            Some(&PropertyValue::string("hello"))
        );

        // The head now points at a super root carrying the merged root.
        let other = Branch::new(store).unwrap();
        assert_eq!(other.root().unwrap(), merged);
    }

    #[test]
    fn merge_without_changes_returns_current_root() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let before = store.stats().nodes_written();
        let mut branch = Branch::new(store.clone()).unwrap();
        branch.merge(&EmptyHook, &CommitInfo::new()).unwrap();
        assert_eq!(store.stats().nodes_written(), before);
    }

    #[test]
    fn concurrent_merges_both_land() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let mut first = Branch::new(Arc::clone(&store)).unwrap();
        let mut second = Branch::new(Arc::clone(&store)).unwrap();

        let root = first.root().unwrap();
        let mut builder = root.builder();
        builder.child("left").unwrap();
        first.set_root(&builder.write().unwrap());

        let root = second.root().unwrap();
        let mut builder = root.builder();
        builder.child("right").unwrap();
        second.set_root(&builder.write().unwrap());

        first.merge(&EmptyHook, &CommitInfo::new()).unwrap();
        let merged = second.merge(&EmptyHook, &CommitInfo::new()).unwrap();

        assert!(merged.has_child("left"));
        assert!(merged.has_child("right"));
    }

    #[test]
    fn hook_rejection_aborts_the_merge() {
        struct RejectAll;
        impl CommitHook for RejectAll {
            fn process_commit(
                &self,
                _before: &NodeState,
                _after: NodeState,
                _info: &CommitInfo,
            ) -> CoreResult<NodeState> {
                Err(CoreError::commit_failed("rejected"))
            }
        }

        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let head_before = store.head();

        let mut branch = Branch::new(Arc::clone(&store)).unwrap();
        let root = branch.root().unwrap();
        let mut builder = root.builder();
        builder.set_property("x", PropertyValue::Long(1));
        branch.set_root(&builder.write().unwrap());

        let result = branch.merge(&RejectAll, &CommitInfo::new());
        assert!(matches!(result, Err(CoreError::CommitFailed { .. })));
        assert_eq!(store.head(), head_before);
    }

    #[test]
    fn rebase_picks_up_other_merges() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let mut behind = Branch::new(Arc::clone(&store)).unwrap();

        let mut other = Branch::new(Arc::clone(&store)).unwrap();
        let root = other.root().unwrap();
        let mut builder = root.builder();
        builder.child("published").unwrap();
        other.set_root(&builder.write().unwrap());
        other.merge(&EmptyHook, &CommitInfo::new()).unwrap();

        behind.rebase().unwrap();
        assert!(behind.root().unwrap().has_child("published"));
    }

    #[test]
    fn lost_races_leave_no_stale_conflict_markers() {
        // Publishes a competing commit from inside the hook, so the
        // merge loses its first two rounds. The second competitor puts
        // the contested property back to its base value, which means
        // the round that finally wins has nothing to conflict with; a
        // marker from an earlier lost round must not survive into the
        // published tree.
        struct CompetingWriter {
            store: Arc<FileStore>,
            calls: AtomicUsize,
        }

        impl CommitHook for CompetingWriter {
            fn process_commit(
                &self,
                _before: &NodeState,
                after: NodeState,
                _info: &CommitInfo,
            ) -> CoreResult<NodeState> {
                let value = match self.calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Some("rival"),
                    1 => Some("base"),
                    _ => None,
                };
                if let Some(value) = value {
                    let mut rival = Branch::new(Arc::clone(&self.store))?;
                    let mut builder = rival.root()?.builder();
                    builder.set_property("color", PropertyValue::string(value));
                    rival.set_root(&builder.write()?);
                    rival.merge(&EmptyHook, &CommitInfo::new())?;
                }
                Ok(after)
            }
        }

        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let mut seed = Branch::new(Arc::clone(&store)).unwrap();
        let mut builder = seed.root().unwrap().builder();
        builder.set_property("color", PropertyValue::string("base"));
        seed.set_root(&builder.write().unwrap());
        seed.merge(&EmptyHook, &CommitInfo::new()).unwrap();

        let mut branch = Branch::new(Arc::clone(&store)).unwrap();
        let mut builder = branch.root().unwrap().builder();
        builder.set_property("color", PropertyValue::string("mine"));
        branch.set_root(&builder.write().unwrap());

        let hook = CompetingWriter {
            store: Arc::clone(&store),
            calls: AtomicUsize::new(0),
        };
        let merged = branch.merge(&hook, &CommitInfo::new()).unwrap();

        assert_eq!(
            merged.property("color"),
            Some(&PropertyValue::string("mine"))
        );
        assert!(!merged.has_child(CONFLICT_NAME));
    }

    #[test]
    fn expired_lock_is_broken() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let journal = store.journal();

        // Plant a long-expired lock on the head.
        let head = store.head();
        let mut locked = store.read_node(head).unwrap();
        locked.set_property(TOKEN_NAME, PropertyValue::string("stale"));
        locked.set_property(TIMEOUT_NAME, PropertyValue::Long(now_millis() - 60_000));
        let locked_id = store.write_node(&locked).unwrap();
        assert!(journal.set_head(head, locked_id));

        let mut branch = Branch::new(Arc::clone(&store)).unwrap();
        let root = branch.root().unwrap();
        let mut builder = root.builder();
        builder.set_property("survived", PropertyValue::Long(1));
        branch.set_root(&builder.write().unwrap());

        let merged = branch.merge(&EmptyHook, &CommitInfo::new()).unwrap();
        assert_eq!(merged.property("survived"), Some(&PropertyValue::Long(1)));

        // The lock token did not leak into the published super root.
        let super_node = store.read_node(store.head()).unwrap();
        assert!(super_node.property(TOKEN_NAME).is_none());
    }
}
