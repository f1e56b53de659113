use crate::{
    check::PermissionChecker,
    config::EngineConfig,
    error::Result,
    expand::{ExpandNode, SubjectExpander},
    models::*,
    repository::{
        InMemoryNamespaceStore, InMemoryTupleStore, NamespaceStore, RevisionClock, TupleStore,
        TupleStream,
    },
    schema::NamespaceDefinition,
    watch::WatchFeed,
};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Core Zanzibar authorization engine
pub struct AuthorizationEngine {
    /// Storage for relationship tuples
    tuples: Arc<dyn TupleStore>,

    /// Versioned namespace definitions
    namespaces: Arc<dyn NamespaceStore>,

    /// Permission checker for authorization queries
    checker: Arc<PermissionChecker>,

    /// Subject expander for listing subjects
    expander: Arc<SubjectExpander>,

    /// Change feed over the tuple store
    feed: WatchFeed,

    config: EngineConfig,
}

impl AuthorizationEngine {
    /// Create an engine over the given stores
    pub fn new(
        tuples: Arc<dyn TupleStore>,
        namespaces: Arc<dyn NamespaceStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let checker = Arc::new(PermissionChecker::new(
            tuples.clone(),
            namespaces.clone(),
            config.check.clone(),
        )?);
        let expander = Arc::new(SubjectExpander::new(
            tuples.clone(),
            namespaces.clone(),
            &config.check,
        )?);
        let feed = WatchFeed::new(tuples.clone(), config.watch.clone())?;

        Ok(Self {
            tuples,
            namespaces,
            checker,
            expander,
            feed,
            config,
        })
    }

    /// Create an engine backed by in-memory stores sharing one revision sequence
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        let clock = Arc::new(RevisionClock::new());
        let namespaces = Arc::new(InMemoryNamespaceStore::new(Arc::clone(&clock)));
        let tuples = Arc::new(InMemoryTupleStore::new(
            clock,
            namespaces.clone(),
            &config.watch,
        ));
        info!(
            max_depth = config.check.max_depth,
            history_limit = config.watch.history_limit,
            "Created in-memory authorization engine"
        );
        Self::new(tuples, namespaces, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =============================================================================
    // Schema Management
    // =============================================================================

    /// Validate and store a namespace definition
    pub async fn write_namespace(&self, definition: NamespaceDefinition) -> Result<Revision> {
        self.namespaces.write_namespace(definition).await
    }

    /// Read a namespace definition as of `at`, or the head
    pub async fn read_namespace(
        &self,
        name: &str,
        at: Option<Revision>,
    ) -> Result<Arc<NamespaceDefinition>> {
        let at = self.resolve(at).await?;
        self.namespaces.read_namespace(name, at).await
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Atomically apply mutations guarded by preconditions
    pub async fn write_tuples(
        &self,
        mutations: Vec<Mutation>,
        preconditions: Vec<Precondition>,
    ) -> Result<Revision> {
        self.tuples.write_tuples(mutations, preconditions).await
    }

    /// Stream tuples matching `filter` as of `at`, or the head
    pub async fn query_tuples(&self, filter: TupleFilter, at: Option<Revision>) -> Result<TupleStream> {
        let at = self.resolve(at).await?;
        self.tuples.query_tuples(filter, at).await
    }

    /// Current head revision
    pub async fn revision(&self) -> Result<Revision> {
        self.tuples.revision().await
    }

    async fn resolve(&self, at: Option<Revision>) -> Result<Revision> {
        match at {
            Some(revision) => Ok(revision),
            None => self.tuples.revision().await,
        }
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check if a subject holds a relation on an object
    pub async fn check_permission(
        &self,
        request: CheckRequest,
        cancel: &CancellationToken,
    ) -> Result<CheckResponse> {
        let revision = self.resolve(request.at_revision).await?;
        let allowed = self
            .checker
            .check(&request.resource, &request.subject, revision, cancel)
            .await?;
        Ok(CheckResponse { allowed, revision })
    }

    /// Batch check multiple permissions at once.
    ///
    /// Requests without a pinned revision all evaluate at the same head.
    pub async fn batch_check(
        &self,
        requests: Vec<CheckRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResponse>> {
        let head = self.tuples.revision().await?;
        let count = requests.len();

        let responses: Vec<CheckResponse> = stream::iter(requests)
            .map(|request| {
                let request = CheckRequest {
                    at_revision: Some(request.at_revision.unwrap_or(head)),
                    ..request
                };
                self.check_permission(request, cancel)
            })
            .buffered(self.config.check.max_fanout)
            .try_collect()
            .await?;

        debug!(
            count,
            allowed = responses.iter().filter(|r| r.allowed).count(),
            "Batch check complete"
        );
        Ok(responses)
    }

    /// Expand the subjects holding `onr.relation` on `onr`
    pub async fn expand(&self, onr: &ObjectAndRelation, at: Option<Revision>) -> Result<ExpandNode> {
        let at = self.resolve(at).await?;
        self.expander.expand(onr, at).await
    }

    // =============================================================================
    // Change Feed
    // =============================================================================

    /// Subscribe to tuple changes committed after `since`
    pub async fn watch(
        &self,
        since: Revision,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        self.feed.watch(since, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZanzibarError;
    use crate::schema::{RelationDefinition, Rewrite};

    async fn engine() -> AuthorizationEngine {
        let engine = AuthorizationEngine::in_memory(EngineConfig::default()).unwrap();
        engine
            .write_namespace(
                NamespaceDefinition::new("document")
                    .with_relation(RelationDefinition::direct("owner"))
                    .with_relation(RelationDefinition::rewritten(
                        "viewer",
                        Rewrite::union(vec![Rewrite::This, Rewrite::computed("owner")]),
                    )),
            )
            .await
            .unwrap();
        engine
    }

    fn request(resource: &str, subject: &str) -> CheckRequest {
        CheckRequest::new(resource.parse().unwrap(), subject.parse().unwrap())
    }

    #[tokio::test]
    async fn test_check_defaults_to_head() {
        let engine = engine().await;
        let rev = engine
            .write_tuples(vec![Mutation::add("document:1#owner@user:alice".parse().unwrap())], vec![])
            .await
            .unwrap();

        let response = engine
            .check_permission(request("document:1#viewer", "user:alice"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.allowed);
        assert_eq!(response.revision, rev);
    }

    #[tokio::test]
    async fn test_check_at_old_revision() {
        let engine = engine().await;
        let before = engine.revision().await.unwrap();
        engine
            .write_tuples(vec![Mutation::add("document:1#owner@user:alice".parse().unwrap())], vec![])
            .await
            .unwrap();

        let response = engine
            .check_permission(
                request("document:1#viewer", "user:alice").at(before),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!response.allowed);
        assert_eq!(response.revision, before);
    }

    #[tokio::test]
    async fn test_batch_check_preserves_order() {
        let engine = engine().await;
        engine
            .write_tuples(vec![Mutation::add("document:1#owner@user:alice".parse().unwrap())], vec![])
            .await
            .unwrap();

        let responses = engine
            .batch_check(
                vec![
                    request("document:1#viewer", "user:alice"),
                    request("document:1#viewer", "user:bob"),
                    request("document:1#owner", "user:alice"),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let allowed: Vec<bool> = responses.iter().map(|r| r.allowed).collect();
        assert_eq!(allowed, vec![true, false, true]);
        assert!(responses.windows(2).all(|w| w[0].revision == w[1].revision));
    }

    #[tokio::test]
    async fn test_future_revision_rejected() {
        let engine = engine().await;
        let future = engine.revision().await.unwrap().next();
        let result = engine
            .check_permission(request("document:1#viewer", "user:alice").at(future), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ZanzibarError::RevisionNotAvailable(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.check.max_depth = 0;
        assert!(AuthorizationEngine::in_memory(config).is_err());
    }
}
