//! Pre-execution checks. Everything here runs before the first write.

use grafter_core::record::key_string;
use grafter_core::{CoreError, NodeId, RelationExpression};

use crate::data::GraphData;
use crate::error::{Result, UpsertError};

/// Checks the pruned graphs against the options and the allowed expression.
///
/// `input_expr` is the relation expression covered by the input.
pub fn validate(
    data: &GraphData,
    input_expr: &RelationExpression,
    allowed: Option<&RelationExpression>,
) -> Result<()> {
    check_not_found(data)?;
    check_allowed_relations(input_expr, allowed)?;
    check_references(data)?;
    check_pruned_targets(data)?;
    if data.options.is_insert_only() {
        check_to_many_relate(data)?;
    }
    Ok(())
}

fn display_id(data: &GraphData, node: NodeId) -> String {
    data.graph
        .node(node)
        .id_key()
        .map_or_else(|| "null".to_string(), |key| key_string(&key))
}

fn check_not_found(data: &GraphData) -> Result<()> {
    let options = &data.options;
    for node in data.graph.nodes() {
        if !data.graph.node(node).has_id()
            || options.should_insert_ignore_disable(node, data)
            || options.should_relate_ignore_disable(node, data)
            || data.current_for(node).is_some()
        {
            continue;
        }

        let message = match data.graph.parent(node) {
            None => format!(
                "root model (id={}) does not exist. If you want to insert it with an id, use the insertMissing option",
                display_id(data, node)
            ),
            Some(parent) => format!(
                "model (id={}) is not a child of model (id={}). If you want to relate it, use the relate option. If you want to insert it with an id, use the insertMissing option",
                display_id(data, node),
                display_id(data, parent)
            ),
        };
        return Err(UpsertError::NotFound {
            data_path: data.graph.data_path(node).to_string(),
            message,
        });
    }
    Ok(())
}

fn check_allowed_relations(
    input_expr: &RelationExpression,
    allowed: Option<&RelationExpression>,
) -> Result<()> {
    match allowed {
        Some(allowed) if !allowed.is_sub_expression(input_expr) => {
            Err(UpsertError::UnallowedRelation {
                expression: input_expr.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn check_references(data: &GraphData) -> Result<()> {
    if data.options.allow_refs {
        return Ok(());
    }
    let referencing = data
        .graph
        .nodes()
        .find(|node| data.graph.references_from(*node).next().is_some());
    match referencing {
        Some(node) => Err(CoreError::invalid_graph(
            data.graph.data_path(node),
            "graph contains references but allowRefs is not set",
        )
        .into()),
        None => Ok(()),
    }
}

/// A reference may only reach into the nested data of a related node from
/// inside that same nested data. Anything else would need values the nested
/// upsert only produces after every outer write.
fn check_pruned_targets(data: &GraphData) -> Result<()> {
    let graph = &data.graph;
    for edge in graph.all_references() {
        if !graph.node(edge.related).detached {
            continue;
        }
        let anchor = graph.attached_ancestor(edge.related);
        if !graph.node(edge.owner).detached || graph.attached_ancestor(edge.owner) != anchor {
            let nested_under = anchor.map_or("", |node| graph.data_path(node));
            return Err(CoreError::invalid_graph(
                graph.data_path(edge.owner),
                format!(
                    "reference to '{}' points into the nested graph of the related model at '{}', which is upserted separately",
                    graph.data_path(edge.related),
                    nested_under
                ),
            )
            .into());
        }
    }
    Ok(())
}

fn check_to_many_relate(data: &GraphData) -> Result<()> {
    for node in data.graph.nodes() {
        let Some(relation) = data.graph.parent_relation(node) else {
            continue;
        };
        if relation.is_to_many() && data.options.should_relate(node, data) {
            return Err(UpsertError::UnsupportedOperation {
                message: format!(
                    "cannot relate '{}' at '{}' in insert-only mode because it requires an update; use a full upsert",
                    relation.name,
                    data.graph.data_path(node)
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::existence::NodeDbExistence;
    use crate::options::{GraphOptions, OptionFlag};
    use crate::prune::prune;
    use grafter_core::{ModelGraph, RecordType, Relation, Schema};
    use serde_json::{json, Value};

    fn schema() -> Schema {
        Schema::new().with_type(
            RecordType::new("Person", "persons")
                .with_relation(Relation::to_many("children", "Person", &["id"], &["parentId"]))
                .with_relation(Relation::to_one("parent", "Person", &["parentId"], &["id"])),
        )
    }

    fn data(desired: &Value, current: Value, options: GraphOptions) -> (GraphData, RelationExpression) {
        let schema = schema();
        let roots: Vec<_> = match desired {
            Value::Array(items) => items.iter().filter_map(Value::as_object).cloned().collect(),
            other => other.as_object().into_iter().cloned().collect(),
        };
        let expr = RelationExpression::from_records(&schema, "Person", &roots).unwrap();
        let data = GraphData::new(
            ModelGraph::build(&schema, "Person", desired).unwrap(),
            ModelGraph::build(&schema, "Person", &current).unwrap(),
            options,
            NodeDbExistence::assume_all(),
        );
        (data, expr)
    }

    #[test]
    fn unknown_child_id_is_not_found() {
        let (data, expr) = data(
            &json!({"id": 5, "name": "A", "children": [{"id": 9}]}),
            json!([{"id": 5, "children": []}]),
            GraphOptions::default(),
        );
        let err = validate(&data, &expr, None).unwrap_err();
        match err {
            UpsertError::NotFound { data_path, message } => {
                assert_eq!(data_path, "children[0]");
                assert!(message.starts_with("model (id=9) is not a child of model (id=5)"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_root_is_not_found() {
        let (data, expr) = data(&json!([{"id": 3}]), json!([]), GraphOptions::default());
        let err = validate(&data, &expr, None).unwrap_err();
        match err {
            UpsertError::NotFound { data_path, message } => {
                assert_eq!(data_path, "[0]");
                assert!(message.starts_with("root model (id=3) does not exist"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn insert_missing_accepts_unknown_ids() {
        let options = GraphOptions {
            insert_missing: true.into(),
            ..GraphOptions::default()
        };
        let (data, expr) = data(&json!({"id": 3, "children": [{"id": 4}]}), json!([]), options);
        assert!(validate(&data, &expr, None).is_ok());
    }

    #[test]
    fn relations_outside_the_allowed_expression_fail() {
        let (data, expr) = data(
            &json!({"name": "a", "children": [{"parent": null}]}),
            json!([]),
            GraphOptions::default(),
        );
        let allowed = RelationExpression::parse("children").unwrap();
        let err = validate(&data, &expr, Some(&allowed)).unwrap_err();
        assert!(matches!(err, UpsertError::UnallowedRelation { .. }));

        let wider = RelationExpression::parse("children.parent").unwrap();
        assert!(validate(&data, &expr, Some(&wider)).is_ok());
    }

    #[test]
    fn references_need_allow_refs() {
        let input = json!({"#id": "a", "name": "x", "children": [{"name": "#ref{a.name}"}]});
        let (data, expr) = data(&input, json!([]), GraphOptions::default());
        let err = validate(&data, &expr, None).unwrap_err();
        assert!(matches!(err, UpsertError::Core(CoreError::InvalidGraph { .. })));

        let options = GraphOptions {
            allow_refs: true,
            ..GraphOptions::default()
        };
        let (data, expr) = self::data(&input, json!([]), options);
        assert!(validate(&data, &expr, None).is_ok());
    }

    #[test]
    fn references_into_related_subtrees_fail() {
        let options = GraphOptions {
            relate: OptionFlag::paths(["children"]),
            allow_refs: true,
            ..GraphOptions::default()
        };
        let input = json!({"id": 1, "children": [
            {"id": 7, "children": [{"#id": "g", "name": "G"}]},
            {"name": "after #ref{g.name}"}
        ]});
        let (mut data, expr) = data(&input, json!([{"id": 1, "children": []}]), options.clone());
        prune(&mut data);
        match validate(&data, &expr, None).unwrap_err() {
            UpsertError::Core(CoreError::InvalidGraph { data_path, message }) => {
                assert_eq!(data_path, "children[1]");
                assert!(message.contains("'children[0].children[0]'"));
                assert!(message.contains("at 'children[0]'"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // the same reference from inside the related node's nested data is fine
        let input = json!({"id": 1, "children": [
            {"id": 7, "children": [{"#id": "g", "name": "G"}, {"name": "after #ref{g.name}"}]}
        ]});
        let (mut data, expr) = self::data(&input, json!([{"id": 1, "children": []}]), options);
        prune(&mut data);
        assert!(validate(&data, &expr, None).is_ok());
    }

    #[test]
    fn db_refs_are_always_allowed() {
        let (data, expr) = data(&json!({"parent": {"#dbRef": 1}}), json!([]), GraphOptions::default());
        assert!(validate(&data, &expr, None).is_ok());
    }

    #[test]
    fn insert_only_cannot_relate_to_many() {
        let (data, expr) = data(
            &json!({"name": "a", "children": [{"#dbRef": 4}]}),
            json!([]),
            GraphOptions::insert_only(),
        );
        let err = validate(&data, &expr, None).unwrap_err();
        assert!(matches!(err, UpsertError::UnsupportedOperation { .. }));
    }
}
