use crate::{
    error::{Result, ZanzibarError},
    models::*,
    schema::NamespaceDefinition,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

pub mod memory;
pub mod namespace;

pub use memory::InMemoryTupleStore;
pub use namespace::InMemoryNamespaceStore;

/// Ordered, snapshot-consistent sequence of tuples produced by a query
pub type TupleStream = BoxStream<'static, Result<Tuple>>;

/// Events read from the revision log in one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub events: Vec<WatchEvent>,
    /// Every revision up to and including this one has been scanned
    pub through: Revision,
}

/// Storage contract for relation tuples.
///
/// Implementations must commit batches atomically, assign one gapless
/// revision per committed batch and never expose data newer than the
/// revision a read is pinned to.
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Apply an ordered batch of mutations atomically
    async fn write_tuples(
        &self,
        mutations: Vec<Mutation>,
        preconditions: Vec<Precondition>,
    ) -> Result<Revision>;

    /// Tuples matching the filter as of `at`, ordered by
    /// (object id, relation, subject namespace, subject id)
    async fn query_tuples(&self, filter: TupleFilter, at: Revision) -> Result<TupleStream>;

    /// Current head revision
    async fn revision(&self) -> Result<Revision>;

    /// Committed changes after `after`, whole batches only, up to roughly `limit` events
    async fn read_changes(&self, after: Revision, limit: usize) -> Result<ChangeSet>;

    /// Receiver notified with the new head after every commit
    fn subscribe(&self) -> watch::Receiver<Revision>;
}

/// Storage contract for namespace definitions
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Validate and store a new version of a namespace
    async fn write_namespace(&self, definition: NamespaceDefinition) -> Result<Revision>;

    /// The newest version of `name` committed at or before `at`
    async fn read_namespace(&self, name: &str, at: Revision) -> Result<Arc<NamespaceDefinition>>;

    async fn revision(&self) -> Result<Revision>;
}

/// Gapless revision sequence shared by the stores of one engine.
///
/// Every commit runs inside [`RevisionClock::begin_commit`]; the new head is
/// only published once the batch is fully applied.
pub struct RevisionClock {
    commit: Mutex<()>,
    head: AtomicU64,
    notifier: watch::Sender<Revision>,
}

impl RevisionClock {
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(Revision::zero());
        Self {
            commit: Mutex::new(()),
            head: AtomicU64::new(0),
            notifier,
        }
    }

    pub fn head(&self) -> Revision {
        Revision(self.head.load(Ordering::Acquire))
    }

    /// Enter the commit critical section
    pub async fn begin_commit(&self) -> CommitGuard<'_> {
        let lock = self.commit.lock().await;
        let revision = self.head().next();
        CommitGuard {
            clock: self,
            _lock: lock,
            revision,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Revision> {
        self.notifier.subscribe()
    }

    /// Reads may not be pinned past the head
    pub fn ensure_readable(&self, at: Revision) -> Result<()> {
        if at > self.head() {
            return Err(ZanzibarError::RevisionNotAvailable(at));
        }
        Ok(())
    }
}

impl Default for RevisionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to commit the next revision. Dropping it without
/// publishing leaves the head untouched.
pub struct CommitGuard<'a> {
    clock: &'a RevisionClock,
    _lock: MutexGuard<'a, ()>,
    revision: Revision,
}

impl CommitGuard<'_> {
    /// Revision the batch will be committed at
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Head as of entering the critical section
    pub fn base(&self) -> Revision {
        Revision(self.revision.0 - 1)
    }

    /// Make the revision visible to readers and wake subscribers
    pub fn publish(self) -> Revision {
        self.clock.head.store(self.revision.0, Ordering::Release);
        self.clock.notifier.send_replace(self.revision);
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_publishes_in_order() {
        let clock = RevisionClock::new();
        let mut rx = clock.subscribe();

        let guard = clock.begin_commit().await;
        assert_eq!(guard.revision(), Revision(1));
        assert_eq!(guard.base(), Revision(0));
        assert_eq!(clock.head(), Revision(0));
        guard.publish();

        assert_eq!(clock.head(), Revision(1));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Revision(1));
    }

    #[tokio::test]
    async fn test_abandoned_commit_keeps_sequence_gapless() {
        let clock = RevisionClock::new();
        drop(clock.begin_commit().await);
        assert_eq!(clock.head(), Revision(0));
        assert_eq!(clock.begin_commit().await.publish(), Revision(1));
    }

    #[test]
    fn test_reads_past_head_rejected() {
        let clock = RevisionClock::new();
        assert!(clock.ensure_readable(Revision(0)).is_ok());
        assert!(matches!(
            clock.ensure_readable(Revision(1)),
            Err(ZanzibarError::RevisionNotAvailable(Revision(1)))
        ));
    }
}
