use crate::{
    check::EvalPath,
    config::CheckConfig,
    error::{Result, ZanzibarError},
    models::*,
    repository::{NamespaceStore, TupleStore},
    schema::Rewrite,
};
use futures::future::{BoxFuture, FutureExt};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Tree of subjects holding a relation, shaped like the relation's rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandNode {
    /// Direct tuples; userset subjects are expanded in `children`
    Leaf {
        onr: ObjectAndRelation,
        subjects: Vec<Subject>,
        children: Vec<ExpandNode>,
    },
    Union {
        onr: ObjectAndRelation,
        children: Vec<ExpandNode>,
    },
    Intersection {
        onr: ObjectAndRelation,
        children: Vec<ExpandNode>,
    },
    Exclusion {
        onr: ObjectAndRelation,
        base: Box<ExpandNode>,
        subtract: Box<ExpandNode>,
    },
}

impl ExpandNode {
    pub fn onr(&self) -> &ObjectAndRelation {
        match self {
            Self::Leaf { onr, .. }
            | Self::Union { onr, .. }
            | Self::Intersection { onr, .. }
            | Self::Exclusion { onr, .. } => onr,
        }
    }

    /// Every concrete (non-userset) subject mentioned anywhere in the tree,
    /// ignoring set semantics
    pub fn mentioned_users(&self) -> BTreeSet<Subject> {
        let mut out = BTreeSet::new();
        self.collect_users(&mut out);
        out
    }

    fn collect_users(&self, out: &mut BTreeSet<Subject>) {
        match self {
            Self::Leaf {
                subjects, children, ..
            } => {
                out.extend(subjects.iter().filter(|s| !s.is_userset()).cloned());
                children.iter().for_each(|c| c.collect_users(out));
            }
            Self::Union { children, .. } | Self::Intersection { children, .. } => {
                children.iter().for_each(|c| c.collect_users(out));
            }
            Self::Exclusion { base, subtract, .. } => {
                base.collect_users(out);
                subtract.collect_users(out);
            }
        }
    }
}

/// Subject expander builds the [`ExpandNode`] tree for a relation on an object
pub struct SubjectExpander {
    tuples: Arc<dyn TupleStore>,
    namespaces: Arc<dyn NamespaceStore>,
    max_depth: u32,
}

impl SubjectExpander {
    pub fn new(
        tuples: Arc<dyn TupleStore>,
        namespaces: Arc<dyn NamespaceStore>,
        config: &CheckConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tuples,
            namespaces,
            max_depth: config.max_depth,
        })
    }

    /// Expand all subjects that have `onr.relation` on `onr` as of `at`
    #[instrument(skip(self), fields(onr = %onr, revision = %at))]
    pub async fn expand(&self, onr: &ObjectAndRelation, at: Revision) -> Result<ExpandNode> {
        let tree = self.expand_relation(onr.clone(), at, EvalPath::root()).await?;
        debug!(users = tree.mentioned_users().len(), "Expanded relation");
        Ok(tree)
    }

    fn expand_relation(
        &self,
        onr: ObjectAndRelation,
        at: Revision,
        path: EvalPath,
    ) -> BoxFuture<'_, Result<ExpandNode>> {
        async move {
            let path = path.enter(&onr, self.max_depth)?;
            let schema = self.namespaces.read_namespace(&onr.namespace, at).await?;
            let relation = schema
                .relation(&onr.relation)
                .ok_or_else(|| ZanzibarError::relation_not_found(&onr.namespace, &onr.relation))?;
            self.expand_rewrite(&onr, relation.effective_rewrite(), at, &path)
                .await
        }
        .boxed()
    }

    fn expand_rewrite<'a>(
        &'a self,
        onr: &'a ObjectAndRelation,
        rewrite: &'a Rewrite,
        at: Revision,
        path: &'a EvalPath,
    ) -> BoxFuture<'a, Result<ExpandNode>> {
        async move {
            match rewrite {
                Rewrite::This => {
                    let subjects: Vec<Subject> = self
                        .tuples
                        .query_tuples(TupleFilter::userset(onr), at)
                        .await?
                        .map_ok(|tuple| tuple.subject)
                        .try_collect()
                        .await?;

                    let mut children = Vec::new();
                    for userset in subjects.iter().filter_map(Subject::as_userset) {
                        children.push(self.expand_relation(userset, at, path.clone()).await?);
                    }
                    Ok(ExpandNode::Leaf {
                        onr: onr.clone(),
                        subjects,
                        children,
                    })
                }
                Rewrite::ComputedUserset { relation } => {
                    let target = ObjectAndRelation::new(&onr.namespace, &onr.object_id, relation);
                    self.expand_relation(target, at, path.clone()).await
                }
                Rewrite::TupleToUserset { tupleset, computed } => {
                    let filter = TupleFilter::namespace(&onr.namespace)
                        .object(&onr.object_id)
                        .relation(tupleset);
                    let related: Vec<Tuple> =
                        self.tuples.query_tuples(filter, at).await?.try_collect().await?;

                    let mut children = Vec::with_capacity(related.len());
                    for tuple in related {
                        let target = ObjectAndRelation::new(
                            &tuple.subject.namespace,
                            &tuple.subject.object_id,
                            computed,
                        );
                        children.push(self.expand_relation(target, at, path.clone()).await?);
                    }
                    Ok(ExpandNode::Union {
                        onr: onr.clone(),
                        children,
                    })
                }
                Rewrite::Union { children } => Ok(ExpandNode::Union {
                    onr: onr.clone(),
                    children: self.expand_all(onr, children, at, path).await?,
                }),
                Rewrite::Intersection { children } => Ok(ExpandNode::Intersection {
                    onr: onr.clone(),
                    children: self.expand_all(onr, children, at, path).await?,
                }),
                Rewrite::Exclusion { base, subtract } => Ok(ExpandNode::Exclusion {
                    onr: onr.clone(),
                    base: Box::new(self.expand_rewrite(onr, base, at, path).await?),
                    subtract: Box::new(self.expand_rewrite(onr, subtract, at, path).await?),
                }),
            }
        }
        .boxed()
    }

    async fn expand_all(
        &self,
        onr: &ObjectAndRelation,
        children: &[Rewrite],
        at: Revision,
        path: &EvalPath,
    ) -> Result<Vec<ExpandNode>> {
        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            nodes.push(self.expand_rewrite(onr, child, at, path).await?);
        }
        Ok(nodes)
    }
}
