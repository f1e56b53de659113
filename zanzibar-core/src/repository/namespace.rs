use crate::{
    error::{Result, ZanzibarError},
    models::Revision,
    repository::{NamespaceStore, RevisionClock},
    schema::NamespaceDefinition,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// In-memory namespace store keeping every committed version of each namespace
pub struct InMemoryNamespaceStore {
    clock: Arc<RevisionClock>,
    versions: DashMap<String, Vec<(Revision, Arc<NamespaceDefinition>)>>,
}

impl InMemoryNamespaceStore {
    pub fn new(clock: Arc<RevisionClock>) -> Self {
        Self {
            clock,
            versions: DashMap::new(),
        }
    }
}

#[async_trait]
impl NamespaceStore for InMemoryNamespaceStore {
    async fn write_namespace(&self, definition: NamespaceDefinition) -> Result<Revision> {
        definition.validate()?;
        for cycle in definition.alias_cycles() {
            warn!(
                namespace = %definition.name,
                relations = ?cycle,
                "Relations alias each other in a loop; checks through them will fail"
            );
        }

        let name = definition.name.clone();
        let relations = definition.relations.len();
        let commit = self.clock.begin_commit().await;
        self.versions
            .entry(name.clone())
            .or_default()
            .push((commit.revision(), Arc::new(definition)));
        let revision = commit.publish();

        info!(namespace = %name, relations, revision = %revision, "Wrote namespace");
        Ok(revision)
    }

    async fn read_namespace(&self, name: &str, at: Revision) -> Result<Arc<NamespaceDefinition>> {
        self.clock.ensure_readable(at)?;
        self.versions
            .get(name)
            .and_then(|versions| {
                versions
                    .iter()
                    .rev()
                    .find(|(revision, _)| *revision <= at)
                    .map(|(_, definition)| Arc::clone(definition))
            })
            .ok_or_else(|| ZanzibarError::NamespaceNotFound(name.to_string()))
    }

    async fn revision(&self) -> Result<Revision> {
        Ok(self.clock.head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RelationDefinition, Rewrite};

    fn store() -> InMemoryNamespaceStore {
        InMemoryNamespaceStore::new(Arc::new(RevisionClock::new()))
    }

    #[tokio::test]
    async fn test_write_and_read_versions() {
        let store = store();
        let v1 = NamespaceDefinition::new("document").with_relation(RelationDefinition::direct("viewer"));
        let v2 = v1.clone().with_relation(RelationDefinition::direct("owner"));

        let r1 = store.write_namespace(v1.clone()).await.unwrap();
        let r2 = store.write_namespace(v2.clone()).await.unwrap();
        assert_eq!(r2, r1.next());

        assert_eq!(*store.read_namespace("document", r1).await.unwrap(), v1);
        assert_eq!(*store.read_namespace("document", r2).await.unwrap(), v2);
    }

    #[tokio::test]
    async fn test_missing_namespace() {
        let store = store();
        let rev = store
            .write_namespace(NamespaceDefinition::new("folder").with_relation(RelationDefinition::direct("viewer")))
            .await
            .unwrap();

        assert!(matches!(
            store.read_namespace("document", rev).await,
            Err(ZanzibarError::NamespaceNotFound(_))
        ));
        // Not yet written at revision zero
        assert!(matches!(
            store.read_namespace("folder", Revision::zero()).await,
            Err(ZanzibarError::NamespaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_schema_not_committed() {
        let store = store();
        let invalid = NamespaceDefinition::new("document")
            .with_relation(RelationDefinition::rewritten("viewer", Rewrite::computed("editor")));

        assert!(matches!(
            store.write_namespace(invalid).await,
            Err(ZanzibarError::SchemaError(_))
        ));
        assert_eq!(store.revision().await.unwrap(), Revision::zero());
    }
}
