//! Integration tests for query compilation.

use jsonapi_graph::{
    compile, load_registry_str, vocabulary, ApiError, Endpoint, FilterExpr, Limit, Operator,
    QueryArgs, RawParams, Registry, SortKey, TypeCategory,
};
use url::form_urlencoded;

const REGISTRY: &str = r#"{
    "resources": [
        {
            "type": "machines",
            "attributes": {
                "name": "string",
                "count": "numeric",
                "load": "float",
                "tags": "list",
                "seen_at": "datetime",
                "active": "bool",
                "pri_id": "string"
            },
            "relationships": {
                "pri": {"target": "principals", "mapping_field": "pri_id"}
            },
            "defaults": {"limit": 25}
        },
        {
            "type": "principals",
            "attributes": {"label": "string", "user_id": "string"},
            "relationships": {
                "user": {"target": "users", "mapping_field": "user_id"},
                "usage": {"target": "usages", "cardinality": "many", "condition": {"reverse": "pri_id"}}
            },
            "defaults": {"allow_unbounded": true}
        },
        {
            "type": "users",
            "attributes": {"name": "string", "team_id": "string"},
            "relationships": {
                "team": {"target": "teams", "mapping_field": "team_id"}
            }
        },
        {
            "type": "teams",
            "attributes": {"title": "string", "lead_id": "string"},
            "relationships": {
                "lead": {"target": "users", "mapping_field": "lead_id"}
            }
        },
        {
            "type": "usages",
            "attributes": {"pri_id": "string", "amount": "numeric"}
        }
    ]
}"#;

fn registry() -> Registry {
    load_registry_str(REGISTRY).unwrap()
}

fn compile_query(type_name: &str, query: &str) -> Result<QueryArgs, ApiError> {
    compile(
        &registry(),
        type_name,
        Endpoint::Collection,
        &RawParams::parse(query),
    )
}

/// `filter=<inner>` with the inner query percent-encoded.
fn filter_param(inner: &str) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("filter", inner)
        .finish()
}

fn assert_invalid(result: Result<QueryArgs, ApiError>, needle: &str) {
    match result {
        Err(err @ ApiError::InvalidQuery { .. }) => {
            assert_eq!(err.status(), 400);
            assert!(
                err.to_string().contains(needle),
                "'{}' does not mention '{}'",
                err,
                needle
            );
        }
        other => panic!("expected InvalidQuery, got {:?}", other),
    }
}

// === Filter Tests ===

mod filters {
    use super::*;

    #[test]
    fn unicode_contains_is_single_and_group() {
        let args = compile_query("machines", &filter_param("name[op]=ct&name[value]=车")).unwrap();
        let filter = args.filter.unwrap();

        let FilterExpr::Group(group) = &filter else {
            panic!("expected a group, got {}", filter);
        };
        assert_eq!(group.children().len(), 1);
        let leaf = filter.find_leaf("name").unwrap();
        assert_eq!(leaf.op, Operator::Ct);
        assert_eq!(leaf.value.to_string(), "车");
    }

    #[test]
    fn repeated_filters_are_or_of_and_groups() {
        let query = format!(
            "{}&{}",
            filter_param("name[op]=eq&name[value]=a"),
            filter_param("count[op]=gte&count[value]=3")
        );
        let args = compile_query("machines", &query).unwrap();
        assert_eq!(
            args.filter.unwrap().to_string(),
            "(((name eq a)) or ((count gte 3)))"
        );
    }

    #[test]
    fn k_occurrences_give_k_groups() {
        for k in 2..=4 {
            let query = (0..k)
                .map(|i| filter_param(&format!("count[op]=eq&count[value]={}", i)))
                .collect::<Vec<_>>()
                .join("&");
            let filter = compile_query("machines", &query).unwrap().filter.unwrap();
            let FilterExpr::Group(group) = filter else {
                panic!("expected OR group");
            };
            assert_eq!(group.children().len(), k);
            assert!(group
                .children()
                .iter()
                .all(|child| matches!(child, FilterExpr::Group(_))));
        }
    }

    #[test]
    fn array_values_rejected_outside_whole_array_operators() {
        let fields = [
            ("name", TypeCategory::String),
            ("count", TypeCategory::Numeric),
            ("load", TypeCategory::Float),
            ("tags", TypeCategory::List),
            ("seen_at", TypeCategory::Datetime),
            ("active", TypeCategory::Bool),
        ];
        for (field, category) in fields {
            for op in vocabulary(category) {
                if op.takes_array() {
                    continue;
                }
                let inner = format!("{f}[op]={op}&{f}[value]=[1,2]", f = field, op = op);
                assert_invalid(compile_query("machines", &filter_param(&inner)), "array");
            }
        }
    }

    #[test]
    fn whole_array_operators_accept_arrays() {
        let args = compile_query(
            "machines",
            &filter_param("tags[op]=aeq&tags[value]=['a','b']"),
        )
        .unwrap();
        let leaf = args.filter.unwrap().find_leaf("tags").cloned().unwrap();
        assert_eq!(leaf.op, Operator::Aeq);
    }

    #[test]
    fn operator_outside_vocabulary_rejected() {
        assert_invalid(
            compile_query("machines", &filter_param("active[op]=gt&active[value]=1")),
            "not supported",
        );
    }

    #[test]
    fn eq_null_only_where_isnull_is_allowed() {
        assert_invalid(
            compile_query("machines", &filter_param("load[op]=eq&load[value]=null")),
            "float field 'load'",
        );

        let args =
            compile_query("machines", &filter_param("count[op]=eq&count[value]=null")).unwrap();
        assert_eq!(args.filter.unwrap().find_leaf("count").unwrap().op, Operator::Isnull);
    }

    #[test]
    fn relationship_id_filter_passes_through() {
        let args =
            compile_query("machines", &filter_param("pri.id[op]=eq&pri.id[value]=p1")).unwrap();
        let filter = args.filter.unwrap();
        assert!(filter.find_leaf("pri_id").is_some());

        assert_invalid(
            compile_query(
                "machines",
                &filter_param("pri.label[op]=eq&pri.label[value]=x"),
            ),
            "unsupported filter field",
        );
    }
}

// === Sort and Paging Tests ===

mod sort_and_paging {
    use super::*;

    #[test]
    fn descending_then_ascending_then_id() {
        let args = compile_query("machines", "sort=-count,name").unwrap();
        assert_eq!(
            args.sort,
            vec![
                SortKey::desc("count"),
                SortKey::asc("name"),
                SortKey::asc("id")
            ]
        );
    }

    #[test]
    fn id_tiebreak_always_appended() {
        let args = compile_query("machines", "sort=-id").unwrap();
        assert_eq!(args.sort, vec![SortKey::desc("id"), SortKey::asc("id")]);
    }

    #[test]
    fn sort_through_one_relationship_level() {
        let args = compile_query("machines", "sort=pri.label").unwrap();
        assert_eq!(args.sort[0], SortKey::asc("pri.label"));

        assert!(compile_query("machines", "sort=pri.user.name").is_err());
        assert!(compile_query("machines", "sort=pri.nothing").is_err());
    }

    #[test]
    fn defaults_apply_without_parameters() {
        let args = compile_query("machines", "").unwrap();
        assert_eq!(args.limit, Limit::Bounded(25));
        assert_eq!(args.skip, 0);
        assert_eq!(args.sort, vec![SortKey::asc("id")]);
        assert!(args.filter.is_none());
    }

    #[test]
    fn unbounded_needs_permission() {
        assert_invalid(compile_query("machines", "page[limit]=unbounded"), "unbounded");

        let args = compile_query("principals", "page[limit]=unbounded").unwrap();
        assert_eq!(args.limit, Limit::Unbounded);
    }

    #[test]
    fn paging_values_must_be_non_negative_integers() {
        assert_invalid(compile_query("machines", "page[offset]=-1"), "page[offset]");
        assert_invalid(compile_query("machines", "page[limit]=ten"), "page[limit]");

        let args = compile_query("machines", "page[offset]=40&page[limit]=10").unwrap();
        assert_eq!(args.skip, 40);
        assert_eq!(args.limit, Limit::Bounded(10));
    }
}

// === Include and Fieldset Tests ===

mod paths {
    use super::*;

    #[test]
    fn nested_include_paths() {
        let args = compile_query("machines", "include=pri.usage,pri.user").unwrap();
        assert_eq!(args.include, vec!["pri.usage", "pri.user"]);
    }

    #[test]
    fn three_levels_accepted_four_rejected() {
        assert!(compile_query("machines", "include=pri.user.team").is_ok());
        assert_invalid(
            compile_query("machines", "include=pri.user.team.lead"),
            "deeper than 3",
        );
        assert_invalid(
            compile_query("machines", "_data=pri.user.team.lead"),
            "deeper than 3",
        );
    }

    #[test]
    fn unknown_segment_named() {
        assert_invalid(
            compile_query("machines", "include=pri.owner"),
            "include path 'pri.owner' has unknown relationship 'owner'",
        );
    }

    #[test]
    fn sparse_fieldsets() {
        let args = compile_query("machines", "fields[machines]=name,pri&fields[users]=name").unwrap();
        assert_eq!(args.fieldset("machines").unwrap(), ["name", "pri"]);
        assert_eq!(args.fieldset("users").unwrap(), ["name"]);

        assert_invalid(compile_query("machines", "fields[ghosts]=name"), "ghosts");
        assert_invalid(compile_query("machines", "fields[users]=colour"), "users.colour");
    }

    #[test]
    fn single_endpoint_whitelist() {
        let registry = registry();
        let params = RawParams::parse("include=pri&fields[principals]=label");
        assert!(compile(&registry, "machines", Endpoint::Single, &params).is_ok());

        let params = RawParams::parse("page[limit]=5");
        assert!(compile(&registry, "machines", Endpoint::Single, &params).is_err());
    }
}
