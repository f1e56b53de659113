use crate::{
    config::CheckConfig,
    error::{Result, ZanzibarError},
    models::*,
    repository::{NamespaceStore, TupleStore},
    schema::{NamespaceDefinition, Rewrite},
};
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

type FastMap<K, V> = DashMap<K, V, ahash::RandomState>;

/// Permission checker evaluating relation rewrites against pinned snapshots of
/// the tuple and namespace stores.
///
/// - Direct tuples and nested usersets (`ThisRelation`)
/// - Aliases on the same object (`ComputedUserset`)
/// - Indirection through related objects (`TupleToUserset`)
/// - Union, intersection and exclusion, with concurrent children
pub struct PermissionChecker {
    tuples: Arc<dyn TupleStore>,
    namespaces: Arc<dyn NamespaceStore>,
    config: CheckConfig,
}

impl PermissionChecker {
    /// Fails with `Configuration` when a depth or fan-out limit is zero
    pub fn new(
        tuples: Arc<dyn TupleStore>,
        namespaces: Arc<dyn NamespaceStore>,
        config: CheckConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tuples,
            namespaces,
            config,
        })
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    /// Check if `subject` has `resource.relation` on `resource` as of revision `at`
    #[instrument(skip(self, cancel), fields(resource = %resource, subject = %subject, revision = %at))]
    pub async fn check(
        &self,
        resource: &ObjectAndRelation,
        subject: &Subject,
        at: Revision,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let ctx = CheckContext {
            checker: self,
            subject,
            at,
            cancel,
            memo: FastMap::default(),
            schemas: FastMap::default(),
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ZanzibarError::Cancelled),
            result = ctx.check_relation(resource.clone(), EvalPath::root()) => result,
        };

        match &result {
            Ok(allowed) => debug!(allowed, memoized = ctx.memo.len(), "Check complete"),
            Err(e) => debug!(error = %e, "Check aborted"),
        }
        result
    }
}

/// The chain of relations currently being evaluated, carried through every
/// recursive call to bound depth and reject repeated entries.
#[derive(Clone, Default)]
pub(crate) struct EvalPath {
    depth: u32,
    tail: Option<Arc<PathNode>>,
}

struct PathNode {
    onr: ObjectAndRelation,
    parent: Option<Arc<PathNode>>,
}

impl EvalPath {
    pub(crate) fn root() -> Self {
        Self::default()
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    fn contains(&self, onr: &ObjectAndRelation) -> bool {
        let mut node = self.tail.as_deref();
        while let Some(n) = node {
            if &n.onr == onr {
                return true;
            }
            node = n.parent.as_deref();
        }
        false
    }

    /// Extend the path with `onr`
    pub(crate) fn enter(&self, onr: &ObjectAndRelation, max_depth: u32) -> Result<Self> {
        if self.depth >= max_depth {
            return Err(ZanzibarError::EvaluationDepthExceeded(format!(
                "depth limit {max_depth} reached at {onr}"
            )));
        }
        if self.contains(onr) {
            return Err(ZanzibarError::EvaluationDepthExceeded(format!(
                "cycle detected at {onr}"
            )));
        }
        Ok(Self {
            depth: self.depth + 1,
            tail: Some(Arc::new(PathNode {
                onr: onr.clone(),
                parent: self.tail.clone(),
            })),
        })
    }
}

/// State shared by every sub-evaluation of one check call
struct CheckContext<'e> {
    checker: &'e PermissionChecker,
    subject: &'e Subject,
    at: Revision,
    cancel: &'e CancellationToken,
    memo: FastMap<ObjectAndRelation, bool>,
    schemas: FastMap<String, Arc<NamespaceDefinition>>,
}

impl<'e> CheckContext<'e> {
    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ZanzibarError::Cancelled);
        }
        Ok(())
    }

    async fn namespace(&self, name: &str) -> Result<Arc<NamespaceDefinition>> {
        let cached = self.schemas.get(name).map(|s| Arc::clone(s.value()));
        if let Some(schema) = cached {
            return Ok(schema);
        }
        let schema = self.checker.namespaces.read_namespace(name, self.at).await?;
        self.schemas.insert(name.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    fn check_relation<'s>(
        &'s self,
        onr: ObjectAndRelation,
        path: EvalPath,
    ) -> BoxFuture<'s, Result<bool>> {
        async move {
            self.ensure_active()?;
            let path = path.enter(&onr, self.checker.config.max_depth)?;

            let memoized = self.memo.get(&onr).map(|hit| *hit);
            if let Some(hit) = memoized {
                trace!(onr = %onr, hit, "Memoized result");
                return Ok(hit);
            }

            let schema = self.namespace(&onr.namespace).await?;
            let relation = schema
                .relation(&onr.relation)
                .ok_or_else(|| ZanzibarError::relation_not_found(&onr.namespace, &onr.relation))?;

            trace!(onr = %onr, depth = path.depth(), "Evaluating relation");
            let result = self
                .evaluate(&onr, relation.effective_rewrite(), &path)
                .await?;

            if self.checker.config.memoize {
                self.memo.insert(onr, result);
            }
            Ok(result)
        }
        .boxed()
    }

    fn evaluate<'s>(
        &'s self,
        onr: &'s ObjectAndRelation,
        rewrite: &'s Rewrite,
        path: &'s EvalPath,
    ) -> BoxFuture<'s, Result<bool>> {
        async move {
            match rewrite {
                Rewrite::This => self.check_direct(onr, path).await,
                Rewrite::ComputedUserset { relation } => {
                    let target = ObjectAndRelation::new(&onr.namespace, &onr.object_id, relation);
                    self.check_relation(target, path.clone()).await
                }
                Rewrite::TupleToUserset { tupleset, computed } => {
                    self.check_tuple_to_userset(onr, tupleset, computed, path)
                        .await
                }
                Rewrite::Union { children } => {
                    let branches: Vec<Result<BoxFuture<'_, Result<bool>>>> = children
                        .iter()
                        .map(|c| Ok(self.evaluate(onr, c, path)))
                        .collect();
                    self.decide(stream::iter(branches), true).await
                }
                Rewrite::Intersection { children } => {
                    let branches: Vec<Result<BoxFuture<'_, Result<bool>>>> = children
                        .iter()
                        .map(|c| Ok(self.evaluate(onr, c, path)))
                        .collect();
                    self.decide(stream::iter(branches), false).await
                }
                Rewrite::Exclusion { base, subtract } => {
                    // base AND NOT subtract, decided by either operand being false
                    let excluded = self.evaluate(onr, subtract, path).map(|r| r.map(|v| !v));
                    let branches: Vec<Result<BoxFuture<'_, Result<bool>>>> =
                        vec![Ok(self.evaluate(onr, base, path)), Ok(excluded.boxed())];
                    self.decide(stream::iter(branches), false).await
                }
            }
        }
        .boxed()
    }

    /// Direct tuples on `onr`, recursing into userset subjects
    async fn check_direct(&self, onr: &ObjectAndRelation, path: &EvalPath) -> Result<bool> {
        let tuples = self
            .checker
            .tuples
            .query_tuples(TupleFilter::userset(onr), self.at)
            .await?;

        let branches = tuples.map_ok(|tuple| {
            if tuple.subject == *self.subject {
                return future::ready(Ok(true)).boxed();
            }
            match tuple.subject.as_userset() {
                Some(userset) => self.check_relation(userset, path.clone()),
                None => future::ready(Ok(false)).boxed(),
            }
        });
        self.decide(branches, true).await
    }

    /// Follow `tupleset` tuples and check `computed` on every related object
    async fn check_tuple_to_userset(
        &self,
        onr: &ObjectAndRelation,
        tupleset: &str,
        computed: &str,
        path: &EvalPath,
    ) -> Result<bool> {
        let filter = TupleFilter::namespace(&onr.namespace)
            .object(&onr.object_id)
            .relation(tupleset);
        let tuples = self.checker.tuples.query_tuples(filter, self.at).await?;

        let branches = tuples.map_ok(|tuple| {
            let target =
                ObjectAndRelation::new(&tuple.subject.namespace, &tuple.subject.object_id, computed);
            self.check_relation(target, path.clone())
        });
        self.decide(branches, true).await
    }

    /// Run branches with bounded concurrency until one yields `decisive`.
    ///
    /// Returning drops the remaining in-flight branches, cancelling them. A
    /// failed branch only fails the whole operation when no other branch
    /// decides it, so the outcome does not depend on completion order.
    async fn decide<'s, S>(&self, branches: S, decisive: bool) -> Result<bool>
    where
        S: Stream<Item = Result<BoxFuture<'s, Result<bool>>>> + Send,
    {
        fn into_evaluation<'a>(branch: Result<BoxFuture<'a, Result<bool>>>) -> BoxFuture<'a, Result<bool>> {
            match branch {
                Ok(evaluation) => evaluation,
                Err(e) => future::ready(Err(e)).boxed(),
            }
        }
        let branches = branches.map(into_evaluation);
        let mut pending = pin!(branches.buffer_unordered(self.checker.config.max_fanout));

        let mut failure = None;
        while let Some(outcome) = pending.next().await {
            self.ensure_active()?;
            match outcome {
                Ok(value) if value == decisive => return Ok(decisive),
                Ok(_) => {}
                Err(ZanzibarError::Cancelled) => return Err(ZanzibarError::Cancelled),
                Err(e) => {
                    trace!(error = %e, "Branch failed, waiting for a deciding sibling");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(!decisive),
        }
    }
}
