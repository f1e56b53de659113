use crate::error::{Result, ZanzibarError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical clock value identifying a consistent snapshot of both stores
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object together with one of its relations, e.g. `document:123#viewer`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    pub fn new(namespace: &str, object_id: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: relation.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        validate_identifier("namespace", &self.namespace)?;
        validate_identifier("object id", &self.object_id)?;
        validate_identifier("relation", &self.relation)
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
    }
}

impl FromStr for ObjectAndRelation {
    type Err = ZanzibarError;

    fn from_str(s: &str) -> Result<Self> {
        let (object, relation) = s
            .split_once('#')
            .ok_or_else(|| ZanzibarError::InvalidFormat(format!("missing relation in '{s}'")))?;
        let (namespace, object_id) = split_object(object)?;
        let onr = Self::new(namespace, object_id, relation);
        onr.validate()?;
        Ok(onr)
    }
}

/// The subject side of a tuple; a subject carrying a relation is a userset
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub namespace: String,
    pub object_id: String,
    pub relation: Option<String>,
}

impl Subject {
    pub fn new(namespace: &str, object_id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn userset(namespace: &str, object_id: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: Some(relation.to_string()),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }

    /// The object and relation this userset refers to
    pub fn as_userset(&self) -> Option<ObjectAndRelation> {
        self.relation
            .as_deref()
            .map(|relation| ObjectAndRelation::new(&self.namespace, &self.object_id, relation))
    }

    fn validate(&self) -> Result<()> {
        validate_identifier("subject namespace", &self.namespace)?;
        validate_identifier("subject id", &self.object_id)?;
        if let Some(ref relation) = self.relation {
            validate_identifier("subject relation", relation)?;
            if relation == ELLIPSIS {
                return Err(ZanzibarError::InvalidFormat(
                    "subject relation '...' is reserved".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}:{}#{}", self.namespace, self.object_id, relation),
            None => write!(f, "{}:{}", self.namespace, self.object_id),
        }
    }
}

impl FromStr for Subject {
    type Err = ZanzibarError;

    fn from_str(s: &str) -> Result<Self> {
        let subject = match s.split_once('#') {
            Some((object, relation)) => {
                let (namespace, object_id) = split_object(object)?;
                Self::userset(namespace, object_id, relation)
            }
            None => {
                let (namespace, object_id) = split_object(s)?;
                Self::new(namespace, object_id)
            }
        };
        subject.validate()?;
        Ok(subject)
    }
}

/// A relation tuple: `object#relation@subject`. Identity is the full content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub object: ObjectAndRelation,
    pub subject: Subject,
}

impl Tuple {
    pub fn new(object: ObjectAndRelation, subject: Subject) -> Self {
        Self { object, subject }
    }

    pub fn namespace(&self) -> &str {
        &self.object.namespace
    }

    pub fn relation(&self) -> &str {
        &self.object.relation
    }

    /// Checks that every identifier is non-empty and free of separators
    pub fn validate(&self) -> Result<()> {
        self.object.validate()?;
        self.subject.validate()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object, self.subject)
    }
}

impl FromStr for Tuple {
    type Err = ZanzibarError;

    fn from_str(s: &str) -> Result<Self> {
        let (object, subject) = s
            .split_once('@')
            .ok_or_else(|| ZanzibarError::InvalidFormat(format!("missing subject in '{s}'")))?;
        Ok(Self::new(object.parse()?, subject.parse()?))
    }
}

fn split_object(s: &str) -> Result<(&str, &str)> {
    s.split_once(':')
        .ok_or_else(|| ZanzibarError::InvalidFormat(format!("expected 'namespace:id', got '{s}'")))
}

fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ZanzibarError::InvalidFormat(format!("{kind} must not be empty")));
    }
    if value.contains([':', '#', '@']) {
        return Err(ZanzibarError::InvalidFormat(format!(
            "{kind} '{value}' contains a reserved character"
        )));
    }
    Ok(())
}

/// Stands for "no subject relation" in filters
pub const ELLIPSIS: &str = "...";

/// Filter for tuple queries. `None` fields act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleFilter {
    pub namespace: String,
    pub object_id: Option<String>,
    pub relation: Option<String>,
    pub subject_namespace: Option<String>,
    pub subject_id: Option<String>,
    pub subject_relation: Option<String>,
}

impl TupleFilter {
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    pub fn object(mut self, object_id: &str) -> Self {
        self.object_id = Some(object_id.to_string());
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    /// Restricts to one exact subject; a plain subject only matches tuples without a subject relation
    pub fn subject(mut self, subject: &Subject) -> Self {
        self.subject_namespace = Some(subject.namespace.clone());
        self.subject_id = Some(subject.object_id.clone());
        self.subject_relation = Some(
            subject
                .relation
                .clone()
                .unwrap_or_else(|| ELLIPSIS.to_string()),
        );
        self
    }

    /// Filter matching exactly the given tuple
    pub fn exact(tuple: &Tuple) -> Self {
        Self::namespace(&tuple.object.namespace)
            .object(&tuple.object.object_id)
            .relation(&tuple.object.relation)
            .subject(&tuple.subject)
    }

    /// Tuples of one object relation, regardless of subject
    pub fn userset(onr: &ObjectAndRelation) -> Self {
        Self::namespace(&onr.namespace)
            .object(&onr.object_id)
            .relation(&onr.relation)
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        fn field(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }

        self.namespace == tuple.object.namespace
            && field(&self.object_id, &tuple.object.object_id)
            && field(&self.relation, &tuple.object.relation)
            && field(&self.subject_namespace, &tuple.subject.namespace)
            && field(&self.subject_id, &tuple.subject.object_id)
            && field(
                &self.subject_relation,
                tuple.subject.relation.as_deref().unwrap_or(ELLIPSIS),
            )
    }
}

impl fmt::Display for TupleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let any = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.namespace,
            any(&self.object_id),
            any(&self.relation),
            any(&self.subject_namespace),
            any(&self.subject_id)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Add,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One entry of an ordered write batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub operation: Operation,
    pub tuple: Tuple,
}

impl Mutation {
    pub fn add(tuple: Tuple) -> Self {
        Self {
            operation: Operation::Add,
            tuple,
        }
    }

    pub fn delete(tuple: Tuple) -> Self {
        Self {
            operation: Operation::Delete,
            tuple,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreconditionOperation {
    MustExist,
    MustNotExist,
}

/// Existence check evaluated against the head revision before a batch commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub operation: PreconditionOperation,
    pub filter: TupleFilter,
}

impl Precondition {
    pub fn must_exist(filter: TupleFilter) -> Self {
        Self {
            operation: PreconditionOperation::MustExist,
            filter,
        }
    }

    pub fn must_not_exist(filter: TupleFilter) -> Self {
        Self {
            operation: PreconditionOperation::MustNotExist,
            filter,
        }
    }
}

/// A single committed tuple mutation as seen by watchers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub revision: Revision,
    pub operation: Operation,
    pub tuple: Tuple,
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource: ObjectAndRelation,
    pub subject: Subject,
    /// Revision to evaluate at; the current head when absent
    pub at_revision: Option<Revision>,
}

impl CheckRequest {
    pub fn new(resource: ObjectAndRelation, subject: Subject) -> Self {
        Self {
            resource,
            subject,
            at_revision: None,
        }
    }

    pub fn at(mut self, revision: Revision) -> Self {
        self.at_revision = Some(revision);
        self
    }
}

/// Authorization check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub revision: Revision,
}
