//! In-memory multi-version tuple store.
//!
//! Tuples are kept per namespace in a `BTreeMap` ordered by
//! (object id, relation, subject namespace, subject id, subject relation).
//! Every key carries its version history; a version is visible at revision
//! `r` when `created <= r < deleted`. Writers stamp new versions with a
//! revision readers cannot pin yet, so readers never wait for a commit and
//! never observe half of a batch.

use crate::{
    config::WatchConfig,
    error::{Result, ZanzibarError},
    models::*,
    repository::{ChangeSet, NamespaceStore, RevisionClock, TupleStore, TupleStream},
    schema::NamespaceDefinition,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Number of index entries scanned per step of a query stream
const SCAN_CHUNK: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    object_id: String,
    relation: String,
    subject_namespace: String,
    subject_id: String,
    subject_relation: Option<String>,
}

impl IndexKey {
    fn from_tuple(tuple: &Tuple) -> Self {
        Self {
            object_id: tuple.object.object_id.clone(),
            relation: tuple.object.relation.clone(),
            subject_namespace: tuple.subject.namespace.clone(),
            subject_id: tuple.subject.object_id.clone(),
            subject_relation: tuple.subject.relation.clone(),
        }
    }

    /// Smallest key a filter can match
    fn lower_bound(filter: &TupleFilter) -> Option<Self> {
        let object_id = filter.object_id.clone()?;
        Some(Self {
            object_id,
            relation: filter.relation.clone().unwrap_or_default(),
            subject_namespace: String::new(),
            subject_id: String::new(),
            subject_relation: None,
        })
    }

    /// Whether the filter can still match this key or anything after it
    fn within_prefix(&self, filter: &TupleFilter) -> bool {
        match (&filter.object_id, &filter.relation) {
            (Some(object_id), Some(relation)) => {
                &self.object_id == object_id && &self.relation == relation
            }
            (Some(object_id), None) => &self.object_id == object_id,
            _ => true,
        }
    }

    fn to_tuple(&self, namespace: &str) -> Tuple {
        Tuple {
            object: ObjectAndRelation::new(namespace, &self.object_id, &self.relation),
            subject: Subject {
                namespace: self.subject_namespace.clone(),
                object_id: self.subject_id.clone(),
                relation: self.subject_relation.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Version {
    created: Revision,
    deleted: Option<Revision>,
}

impl Version {
    fn visible_at(&self, revision: Revision) -> bool {
        self.created <= revision && self.deleted.map_or(true, |d| d > revision)
    }

    fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

type Shard = Arc<RwLock<BTreeMap<IndexKey, Vec<Version>>>>;

struct ScanStep {
    tuples: Vec<Tuple>,
    last: Option<IndexKey>,
    exhausted: bool,
}

/// Scan at most `max` index entries after `after`, keeping those visible at `at`
fn scan(
    shard: &Shard,
    filter: &TupleFilter,
    at: Revision,
    after: Option<&IndexKey>,
    max: usize,
) -> ScanStep {
    let index = shard.read();
    let lower = match (after, IndexKey::lower_bound(filter)) {
        (Some(key), _) => Bound::Excluded(key.clone()),
        (None, Some(key)) => Bound::Included(key),
        (None, None) => Bound::Unbounded,
    };

    let mut step = ScanStep {
        tuples: Vec::new(),
        last: None,
        exhausted: true,
    };
    for (scanned, (key, versions)) in index.range((lower, Bound::Unbounded)).enumerate() {
        if !key.within_prefix(filter) {
            break;
        }
        if scanned == max {
            step.exhausted = false;
            break;
        }
        step.last = Some(key.clone());
        if versions.iter().any(|v| v.visible_at(at)) {
            let tuple = key.to_tuple(&filter.namespace);
            if filter.matches(&tuple) {
                step.tuples.push(tuple);
            }
        }
    }
    step
}

struct LogEntry {
    revision: Revision,
    events: Arc<[WatchEvent]>,
}

/// Ordered log of committed tuple batches, trimmed to a revision window
struct RevisionLog {
    entries: VecDeque<LogEntry>,
    /// Changes after this revision are fully retained
    horizon: Revision,
    history_limit: u64,
}

impl RevisionLog {
    fn append(&mut self, revision: Revision, events: Vec<WatchEvent>) {
        if !events.is_empty() {
            self.entries.push_back(LogEntry {
                revision,
                events: events.into(),
            });
        }

        let keep_from = revision.0.saturating_sub(self.history_limit);
        while let Some(front) = self.entries.front() {
            if front.revision.0 > keep_from {
                break;
            }
            self.horizon = front.revision;
            self.entries.pop_front();
        }
    }

    fn read(&self, after: Revision, head: Revision, limit: usize) -> Result<ChangeSet> {
        if after < self.horizon {
            return Err(ZanzibarError::RevisionNotAvailable(after));
        }

        let start = self.entries.partition_point(|e| e.revision <= after);
        let mut changes = ChangeSet {
            events: Vec::new(),
            through: head.max(after),
        };
        for entry in self.entries.range(start..) {
            if entry.revision > head {
                break;
            }
            if !changes.events.is_empty() && changes.events.len() + entry.events.len() > limit {
                changes.through = Revision(entry.revision.0 - 1);
                break;
            }
            changes.events.extend(entry.events.iter().cloned());
        }
        Ok(changes)
    }
}

/// In-memory tuple store validating writes against a namespace store
pub struct InMemoryTupleStore {
    clock: Arc<RevisionClock>,
    namespaces: Arc<dyn NamespaceStore>,
    shards: DashMap<String, Shard>,
    log: RwLock<RevisionLog>,
}

impl InMemoryTupleStore {
    pub fn new(
        clock: Arc<RevisionClock>,
        namespaces: Arc<dyn NamespaceStore>,
        config: &WatchConfig,
    ) -> Self {
        Self {
            clock,
            namespaces,
            shards: DashMap::new(),
            log: RwLock::new(RevisionLog {
                entries: VecDeque::new(),
                horizon: Revision::zero(),
                history_limit: config.history_limit,
            }),
        }
    }

    fn shard(&self, namespace: &str) -> Option<Shard> {
        self.shards.get(namespace).map(|s| Arc::clone(s.value()))
    }

    fn shard_or_create(&self, namespace: &str) -> Shard {
        Arc::clone(self.shards.entry(namespace.to_string()).or_default().value())
    }

    fn exists(&self, filter: &TupleFilter, at: Revision) -> bool {
        let Some(shard) = self.shard(&filter.namespace) else {
            return false;
        };
        let mut after = None;
        loop {
            let step = scan(&shard, filter, at, after.as_ref(), SCAN_CHUNK);
            if !step.tuples.is_empty() {
                return true;
            }
            if step.exhausted {
                return false;
            }
            after = step.last;
        }
    }

    async fn validate_mutation(
        &self,
        mutation: &Mutation,
        at: Revision,
        schemas: &mut HashMap<String, Arc<NamespaceDefinition>>,
    ) -> Result<()> {
        let tuple = &mutation.tuple;
        tuple
            .validate()
            .map_err(|e| ZanzibarError::InvalidTuple(format!("{tuple}: {e}")))?;

        let schema = match schemas.get(tuple.namespace()) {
            Some(schema) => Arc::clone(schema),
            None => {
                let schema = self
                    .namespaces
                    .read_namespace(tuple.namespace(), at)
                    .await
                    .map_err(|e| match e {
                        ZanzibarError::NamespaceNotFound(ns) => {
                            ZanzibarError::InvalidTuple(format!("{tuple}: unknown namespace '{ns}'"))
                        }
                        other => other,
                    })?;
                schemas.insert(tuple.namespace().to_string(), Arc::clone(&schema));
                schema
            }
        };

        if !schema.has_relation(tuple.relation()) {
            return Err(ZanzibarError::InvalidTuple(format!(
                "{tuple}: unknown relation '{}' in namespace '{}'",
                tuple.relation(),
                tuple.namespace()
            )));
        }
        Ok(())
    }

    /// Apply one mutation at `revision`; returns whether anything changed
    fn apply(&self, mutation: &Mutation, revision: Revision) -> bool {
        let shard = self.shard_or_create(mutation.tuple.namespace());
        let mut index = shard.write();
        let versions = index.entry(IndexKey::from_tuple(&mutation.tuple)).or_default();
        match mutation.operation {
            Operation::Add => {
                if versions.iter().any(Version::is_live) {
                    return false;
                }
                versions.push(Version {
                    created: revision,
                    deleted: None,
                });
                true
            }
            Operation::Delete => match versions.iter_mut().find(|v| v.is_live()) {
                Some(live) => {
                    live.deleted = Some(revision);
                    true
                }
                None => false,
            },
        }
    }
}

#[async_trait]
impl TupleStore for InMemoryTupleStore {
    #[instrument(skip_all, fields(mutations = mutations.len(), preconditions = preconditions.len()))]
    async fn write_tuples(
        &self,
        mutations: Vec<Mutation>,
        preconditions: Vec<Precondition>,
    ) -> Result<Revision> {
        let commit = self.clock.begin_commit().await;
        let base = commit.base();

        let mut schemas = HashMap::new();
        for mutation in &mutations {
            self.validate_mutation(mutation, base, &mut schemas).await?;
        }

        for precondition in &preconditions {
            let exists = self.exists(&precondition.filter, base);
            let satisfied = match precondition.operation {
                PreconditionOperation::MustExist => exists,
                PreconditionOperation::MustNotExist => !exists,
            };
            if !satisfied {
                return Err(ZanzibarError::PreconditionFailed(format!(
                    "{:?} {}",
                    precondition.operation, precondition.filter
                )));
            }
        }

        let revision = commit.revision();
        let mut events = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            if self.apply(&mutation, revision) {
                events.push(WatchEvent {
                    revision,
                    operation: mutation.operation,
                    tuple: mutation.tuple,
                });
            } else {
                debug!(tuple = %mutation.tuple, operation = %mutation.operation, "Mutation was a no-op");
            }
        }

        let changed = events.len();
        self.log.write().append(revision, events);
        let revision = commit.publish();

        info!(revision = %revision, changed, "Committed tuple batch");
        Ok(revision)
    }

    async fn query_tuples(&self, filter: TupleFilter, at: Revision) -> Result<TupleStream> {
        self.clock.ensure_readable(at)?;
        let Some(shard) = self.shard(&filter.namespace) else {
            return Ok(stream::empty().boxed());
        };

        struct Cursor {
            shard: Shard,
            filter: TupleFilter,
            after: Option<IndexKey>,
            buffered: VecDeque<Tuple>,
            exhausted: bool,
        }

        let cursor = Cursor {
            shard,
            filter,
            after: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        let tuples = stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(tuple) = cursor.buffered.pop_front() {
                    return Some((Ok(tuple), cursor));
                }
                if cursor.exhausted {
                    return None;
                }
                let step = scan(
                    &cursor.shard,
                    &cursor.filter,
                    at,
                    cursor.after.as_ref(),
                    SCAN_CHUNK,
                );
                cursor.buffered.extend(step.tuples);
                cursor.exhausted = step.exhausted;
                cursor.after = step.last;
            }
        });

        Ok(tuples.boxed())
    }

    async fn revision(&self) -> Result<Revision> {
        Ok(self.clock.head())
    }

    async fn read_changes(&self, after: Revision, limit: usize) -> Result<ChangeSet> {
        let head = self.clock.head();
        self.log.read().read(after, head, limit)
    }

    fn subscribe(&self) -> watch::Receiver<Revision> {
        self.clock.subscribe()
    }
}
