use crate::{
    config::WatchConfig,
    error::Result,
    models::{Revision, WatchEvent},
    repository::TupleStore,
};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Ordered change feed over a tuple store's revision log
pub struct WatchFeed {
    tuples: Arc<dyn TupleStore>,
    config: WatchConfig,
}

impl WatchFeed {
    pub fn new(tuples: Arc<dyn TupleStore>, config: WatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { tuples, config })
    }

    /// Stream every tuple change committed after `since`, in revision order.
    ///
    /// Fails immediately if `since` is no longer covered by the revision log.
    /// The stream ends cleanly once `cancel` fires.
    pub async fn watch(
        &self,
        since: Revision,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let subscription = Uuid::new_v4();
        let span = info_span!("watch", %subscription, since = %since);
        let batch_size = self.config.batch_size;

        // Subscribe before the first read so no commit falls between them
        let mut notifications = self.tuples.subscribe();
        let first = self
            .tuples
            .read_changes(since, batch_size)
            .instrument(span.clone())
            .await?;
        span.in_scope(|| debug!(backlog = first.events.len(), "Watch subscribed"));

        let tuples = Arc::clone(&self.tuples);
        let stream = async_stream::stream! {
            let mut changes = first;
            loop {
                let cursor = changes.through;
                for event in changes.events {
                    if cancel.is_cancelled() {
                        span.in_scope(|| debug!("Watch cancelled"));
                        return;
                    }
                    yield Ok(event);
                }

                loop {
                    let head = *notifications.borrow_and_update();
                    if head > cursor {
                        break;
                    }
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            span.in_scope(|| debug!(cursor = %cursor, "Watch cancelled"));
                            return;
                        }
                        changed = notifications.changed() => {
                            if changed.is_err() {
                                span.in_scope(|| debug!("Store dropped, closing watch"));
                                return;
                            }
                        }
                    }
                }

                changes = match tuples.read_changes(cursor, batch_size).instrument(span.clone()).await {
                    Ok(changes) => changes,
                    Err(e) => {
                        span.in_scope(|| warn!(cursor = %cursor, error = %e, "Watch fell behind the revision log"));
                        yield Err(e);
                        return;
                    }
                };
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZanzibarError;
    use crate::models::{Mutation, Operation, Tuple};
    use crate::repository::{InMemoryNamespaceStore, InMemoryTupleStore, NamespaceStore, RevisionClock};
    use crate::schema::{NamespaceDefinition, RelationDefinition};
    use std::time::Duration;

    async fn store(config: &WatchConfig) -> Arc<InMemoryTupleStore> {
        let clock = Arc::new(RevisionClock::new());
        let namespaces = Arc::new(InMemoryNamespaceStore::new(Arc::clone(&clock)));
        namespaces
            .write_namespace(NamespaceDefinition::new("document").with_relation(RelationDefinition::direct("viewer")))
            .await
            .unwrap();
        Arc::new(InMemoryTupleStore::new(clock, namespaces, config))
    }

    fn tuple(s: &str) -> Tuple {
        s.parse().unwrap()
    }

    async fn next(stream: &mut BoxStream<'static, Result<WatchEvent>>) -> Option<Result<WatchEvent>> {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("watch stream stalled")
    }

    #[tokio::test]
    async fn test_backlog_then_live_events() {
        let config = WatchConfig::default();
        let tuples = store(&config).await;
        let since = tuples.revision().await.unwrap();
        let feed = WatchFeed::new(tuples.clone(), config).unwrap();

        let r1 = tuples
            .write_tuples(vec![Mutation::add(tuple("document:1#viewer@user:alice"))], vec![])
            .await
            .unwrap();
        let mut stream = feed.watch(since, CancellationToken::new()).await.unwrap();

        let event = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(event.revision, r1);
        assert_eq!(event.operation, Operation::Add);

        let r2 = tuples
            .write_tuples(vec![Mutation::delete(tuple("document:1#viewer@user:alice"))], vec![])
            .await
            .unwrap();
        let event = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(event.revision, r2);
        assert_eq!(event.operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let config = WatchConfig::default();
        let tuples = store(&config).await;
        let feed = WatchFeed::new(tuples.clone(), config).unwrap();
        let cancel = CancellationToken::new();

        let mut stream = feed
            .watch(tuples.revision().await.unwrap(), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_since_before_horizon_rejected() {
        let config = WatchConfig {
            history_limit: 1,
            ..WatchConfig::default()
        };
        let tuples = store(&config).await;
        let feed = WatchFeed::new(tuples.clone(), config).unwrap();

        for id in ["1", "2", "3"] {
            tuples
                .write_tuples(vec![Mutation::add(tuple(&format!("document:{id}#viewer@user:alice")))], vec![])
                .await
                .unwrap();
        }

        let result = feed.watch(Revision::zero(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ZanzibarError::RevisionNotAvailable(_))));
    }
}
