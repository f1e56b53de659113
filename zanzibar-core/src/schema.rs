use crate::error::{Result, ZanzibarError};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Definition of a namespace (object type) and its relations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    pub relations: Vec<RelationDefinition>,
}

/// Definition of a relation within a namespace.
///
/// A relation without a rewrite is satisfied only by direct tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<Rewrite>,
}

/// Userset rewrite expression describing how a relation is computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rewrite {
    /// Direct tuples stored under this relation
    This,
    /// Alias to another relation of the same object
    ComputedUserset { relation: String },
    /// Follow `tupleset` to related objects and evaluate `computed` on each of them
    TupleToUserset { tupleset: String, computed: String },
    Union { children: Vec<Rewrite> },
    Intersection { children: Vec<Rewrite> },
    Exclusion {
        base: Box<Rewrite>,
        subtract: Box<Rewrite>,
    },
}

impl Rewrite {
    pub fn computed(relation: &str) -> Self {
        Self::ComputedUserset {
            relation: relation.to_string(),
        }
    }

    pub fn tuple_to_userset(tupleset: &str, computed: &str) -> Self {
        Self::TupleToUserset {
            tupleset: tupleset.to_string(),
            computed: computed.to_string(),
        }
    }

    pub fn union(children: Vec<Rewrite>) -> Self {
        Self::Union { children }
    }

    pub fn intersection(children: Vec<Rewrite>) -> Self {
        Self::Intersection { children }
    }

    pub fn exclusion(base: Rewrite, subtract: Rewrite) -> Self {
        Self::Exclusion {
            base: Box::new(base),
            subtract: Box::new(subtract),
        }
    }

    /// Visits every relation of the owning namespace referenced by this tree
    fn local_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::This => {}
            Self::ComputedUserset { relation } => out.push(relation),
            Self::TupleToUserset { tupleset, .. } => out.push(tupleset),
            Self::Union { children } | Self::Intersection { children } => {
                for child in children {
                    child.local_references(out);
                }
            }
            Self::Exclusion { base, subtract } => {
                base.local_references(out);
                subtract.local_references(out);
            }
        }
    }

    /// Relations this tree aliases directly on the same object
    fn aliases<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::ComputedUserset { relation } => out.push(relation),
            Self::This | Self::TupleToUserset { .. } => {}
            Self::Union { children } | Self::Intersection { children } => {
                for child in children {
                    child.aliases(out);
                }
            }
            Self::Exclusion { base, subtract } => {
                base.aliases(out);
                subtract.aliases(out);
            }
        }
    }

    fn validate_shape(&self, path: &str) -> Result<()> {
        match self {
            Self::Union { children } | Self::Intersection { children } => {
                if children.is_empty() {
                    return Err(ZanzibarError::SchemaError(format!(
                        "{path}: set operation has no children"
                    )));
                }
                children.iter().try_for_each(|c| c.validate_shape(path))
            }
            Self::Exclusion { base, subtract } => {
                base.validate_shape(path)?;
                subtract.validate_shape(path)
            }
            Self::TupleToUserset { computed, .. } if computed.is_empty() => Err(
                ZanzibarError::SchemaError(format!("{path}: computed relation is empty")),
            ),
            _ => Ok(()),
        }
    }
}

impl RelationDefinition {
    pub fn direct(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rewrite: None,
        }
    }

    pub fn rewritten(name: &str, rewrite: Rewrite) -> Self {
        Self {
            name: name.to_string(),
            rewrite: Some(rewrite),
        }
    }

    /// The rewrite to evaluate; direct tuples when none is configured
    pub fn effective_rewrite(&self) -> &Rewrite {
        static THIS: Rewrite = Rewrite::This;
        self.rewrite.as_ref().unwrap_or(&THIS)
    }
}

impl NamespaceDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            relations: Vec::new(),
        }
    }

    pub fn with_relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relation(name).is_some()
    }

    /// Validate the namespace is well-formed.
    ///
    /// `TupleToUserset.computed` names a relation on the *related* object's
    /// namespace and is only resolved during evaluation.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ZanzibarError::SchemaError("namespace name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for relation in &self.relations {
            if relation.name.is_empty() {
                return Err(ZanzibarError::SchemaError(format!(
                    "namespace '{}' has a relation with an empty name",
                    self.name
                )));
            }
            if !seen.insert(relation.name.as_str()) {
                return Err(ZanzibarError::SchemaError(format!(
                    "duplicate relation '{}' in namespace '{}'",
                    relation.name, self.name
                )));
            }
        }

        for relation in &self.relations {
            let Some(ref rewrite) = relation.rewrite else {
                continue;
            };
            let path = format!("{}#{}", self.name, relation.name);
            rewrite.validate_shape(&path)?;

            let mut references = Vec::new();
            rewrite.local_references(&mut references);
            if let Some(missing) = references.into_iter().find(|r| !seen.contains(r)) {
                return Err(ZanzibarError::SchemaError(format!(
                    "{path} references undefined relation '{missing}'"
                )));
            }
        }

        Ok(())
    }

    /// Groups of relations that alias each other in a loop through `ComputedUserset`.
    ///
    /// Such a namespace is accepted; evaluating through the loop fails at check time.
    pub fn alias_cycles(&self) -> Vec<Vec<String>> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, NodeIndex> = self
            .relations
            .iter()
            .map(|r| (r.name.as_str(), graph.add_node(r.name.as_str())))
            .collect();

        for relation in &self.relations {
            let Some(ref rewrite) = relation.rewrite else {
                continue;
            };
            let mut aliases = Vec::new();
            rewrite.aliases(&mut aliases);
            for alias in aliases {
                if let (Some(&from), Some(&to)) =
                    (nodes.get(relation.name.as_str()), nodes.get(alias))
                {
                    graph.update_edge(from, to, ());
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .filter(|component| match component.as_slice() {
                [single] => graph.contains_edge(*single, *single),
                _ => true,
            })
            .map(|component| {
                let mut names: Vec<String> = component
                    .iter()
                    .filter_map(|n| graph.node_weight(*n).map(|name| (*name).to_string()))
                    .collect();
                names.sort();
                names
            })
            .collect()
    }
}
