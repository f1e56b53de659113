//! Property-based tests for tuple text forms, write idempotence and
//! order-independent set evaluation

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use zanzibar_core::*;

fn identifier() -> impl Strategy<Value = String> {
    "[a-z0-9_][a-z0-9_./-]{0,11}"
}

fn subject() -> impl Strategy<Value = Subject> {
    (identifier(), identifier(), proptest::option::of(identifier())).prop_map(|(ns, id, rel)| match rel {
        Some(rel) => Subject::userset(&ns, &id, &rel),
        None => Subject::new(&ns, &id),
    })
}

fn tuple() -> impl Strategy<Value = Tuple> {
    (identifier(), identifier(), identifier(), subject())
        .prop_map(|(ns, id, rel, subject)| Tuple::new(ObjectAndRelation::new(&ns, &id, &rel), subject))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn engine_with_relations(relations: &[&str]) -> AuthorizationEngine {
    let engine = AuthorizationEngine::in_memory(EngineConfig::default()).unwrap();
    let mut definition = NamespaceDefinition::new("doc");
    for relation in relations {
        definition = definition.with_relation(RelationDefinition::direct(relation));
    }
    engine.write_namespace(definition).await.unwrap();
    engine
}

proptest! {
    #[test]
    fn tuple_text_round_trips(tuple in tuple()) {
        let parsed: Tuple = tuple.to_string().parse().unwrap();
        prop_assert_eq!(parsed, tuple);
    }

    #[test]
    fn repeated_adds_keep_one_tuple(users in prop::collection::vec("[a-e]", 1..12)) {
        runtime().block_on(async {
            let engine = engine_with_relations(&["viewer"]).await;
            for user in &users {
                engine
                    .write_tuples(vec![Mutation::add(format!("doc:1#viewer@user:{user}").parse().unwrap())], vec![])
                    .await
                    .unwrap();
            }

            let mut distinct = users.clone();
            distinct.sort();
            distinct.dedup();

            let stored: Vec<Tuple> = futures::TryStreamExt::try_collect(
                engine.query_tuples(TupleFilter::namespace("doc"), None).await.unwrap(),
            )
            .await
            .unwrap();
            prop_assert_eq!(stored.len(), distinct.len());
            Ok(())
        })?;
    }

    #[test]
    fn union_ignores_child_order(
        grants in prop::collection::vec(any::<bool>(), 4),
        order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
    ) {
        runtime().block_on(async {
            let relations = ["r0", "r1", "r2", "r3"];
            let engine = engine_with_relations(&relations).await;

            let children: Vec<Rewrite> = order.iter().map(|&i| Rewrite::computed(relations[i])).collect();
            let reversed: Vec<Rewrite> = children.iter().rev().cloned().collect();
            let mut definition = NamespaceDefinition::new("doc");
            for relation in relations {
                definition = definition.with_relation(RelationDefinition::direct(relation));
            }
            engine
                .write_namespace(
                    definition
                        .with_relation(RelationDefinition::rewritten("forward", Rewrite::union(children)))
                        .with_relation(RelationDefinition::rewritten("backward", Rewrite::union(reversed))),
                )
                .await
                .unwrap();

            let mutations: Vec<Mutation> = grants
                .iter()
                .zip(relations)
                .filter(|(granted, _)| **granted)
                .map(|(_, relation)| Mutation::add(format!("doc:1#{relation}@user:alice").parse().unwrap()))
                .collect();
            engine.write_tuples(mutations, vec![]).await.unwrap();

            let cancel = CancellationToken::new();
            let check = |relation: &str| {
                engine.check_permission(
                    CheckRequest::new(ObjectAndRelation::new("doc", "1", relation), Subject::user("alice")),
                    &cancel,
                )
            };
            let forward = check("forward").await.unwrap().allowed;
            let backward = check("backward").await.unwrap().allowed;

            prop_assert_eq!(forward, backward);
            prop_assert_eq!(forward, grants.iter().any(|g| *g));
            Ok(())
        })?;
    }
}
