use docstore::predicate::Dialect;
use docstore::query::{Limit, Query, Traits};
use docstore::record::{RecordKind, TypeSchema};
use regex::Regex;
use serde_json::{Map, Value, json};

fn setup() -> TypeSchema {
    TypeSchema::new(json!({"properties": {"age": {"type": "number"}}}))
}

fn compile(dsl: Value, traits: Value, dialect: Dialect) -> docstore::query::CompiledQuery {
    let schema = setup();
    let traits = Traits::from_value(traits).expect("traits");
    Query::from_traits(RecordKind::Document, &schema, dialect, &dsl, &traits)
        .expect("query")
        .compile()
        .expect("compile")
}

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("{other} is not a row"),
    }
}

#[test]
fn default_traits_select_every_column() {
    let compiled = compile(Value::Null, json!({}), Dialect::Postgres);
    assert_eq!(
        compiled.sql,
        "SELECT \"id\" AS \"id\", \"created\" AS \"created\", \"modified\" AS \"modified\", \
         \"type\" AS \"type\", \"content\" AS \"content\" FROM \"document\" ORDER BY \"created\" LIMIT ALL"
    );
    assert!(compiled.params.is_empty());
}

#[test]
fn placeholders_increase_and_match_parameters() {
    let dsl = json!([
        "OR",
        {"age": 3, "name": "x"},
        ["BIND", "age", {"$fn": "a => a > 1"}, 1]
    ]);
    let traits = json!({
        "fields": ["$id", "address.zip", "name"],
        "group": ["$type"],
        "order": [["age", "DESC"], "$created"],
        "limit": 20
    });
    for dialect in [Dialect::Postgres, Dialect::Sqlite] {
        let compiled = compile(dsl.clone(), traits.clone(), dialect);
        let placeholder = Regex::new(r"\$(\d+)").unwrap();
        let numbers: Vec<usize> = placeholder
            .captures_iter(&compiled.sql)
            .map(|c| c[1].parse().unwrap())
            .collect();
        assert_eq!(numbers.len(), compiled.params.len(), "{}", compiled.sql);
        assert_eq!(numbers, (1..=numbers.len()).collect::<Vec<_>>());
        // fields come first, ordering last
        assert_eq!(compiled.params.first(), Some(&json!(match dialect {
            Dialect::Postgres => "{address,zip}",
            Dialect::Sqlite => "$.\"address\".\"zip\"",
        })));
        assert!(compiled.sql.ends_with("DESC, \"created\" LIMIT 20"), "{}", compiled.sql);
    }
}

#[test]
fn count_mode_drops_ordering_and_paging() {
    let compiled = compile(
        json!({"$type": "User"}),
        json!({"count": true, "limit": 5, "offset": 10}),
        Dialect::Postgres,
    );
    assert_eq!(
        compiled.sql,
        "SELECT COUNT(*) AS \"count\" FROM \"document\" WHERE ((\"type\" = $1))"
    );
    assert_eq!(compiled.params, vec![json!("User")]);
    assert_eq!(compiled.decode(row(json!({"count": 2}))).unwrap(), json!(2));
}

#[test]
fn limit_and_offset() {
    let compiled = compile(Value::Null, json!({"limit": 10, "offset": 5}), Dialect::Postgres);
    assert!(compiled.sql.ends_with(" LIMIT 10 OFFSET 5"));
    let compiled = compile(Value::Null, json!({"limit": "ALL"}), Dialect::Sqlite);
    assert!(compiled.sql.ends_with(" LIMIT -1"));
    assert!(Traits::from_value(json!({"limit": "ten"})).is_err());
    assert_eq!(Traits::from_value(json!({"limit": null})).unwrap().limit, Limit::All);
}

#[test]
fn a_query_needs_a_field() {
    let error = Query::new(RecordKind::Document, Dialect::Postgres)
        .compile()
        .unwrap_err();
    assert!(error.is_compile());
}

#[test]
fn payload_fields_are_nested_back() {
    let compiled = compile(
        Value::Null,
        json!({"fields": ["$id", "address.zip", "tags"]}),
        Dialect::Postgres,
    );
    assert!(compiled.sql.starts_with(
        "SELECT \"id\" AS \"id\", \"content\"#>$1::text[] AS \"_f1\", \"content\"->$2::text AS \"_f2\""
    ));
    let record = compiled
        .decode(row(json!({"id": "a", "_f1": 12345, "_f2": ["x"]})))
        .unwrap();
    assert_eq!(record, json!({"id": "a", "address": {"zip": 12345}, "tags": ["x"]}));

    // SQLite hands JSON back as text
    let compiled = compile(Value::Null, json!({"fields": ["$id", "tags"]}), Dialect::Sqlite);
    let record = compiled
        .decode(row(json!({"id": "a", "_f1": "[\"x\",\"y\"]"})))
        .unwrap();
    assert_eq!(record, json!({"id": "a", "tags": ["x", "y"]}));
}

#[test]
fn full_rows_resolve_their_payload() {
    let compiled = compile(Value::Null, json!({}), Dialect::Sqlite);
    let record = compiled
        .decode(row(json!({
            "id": "d1", "created": "2024-01-01T00:00:00Z", "modified": "2024-01-01T00:00:00Z",
            "type": "User", "content": "{\"name\":\"Ada\",\"type\":\"shadow\"}"
        })))
        .unwrap();
    assert_eq!(record["name"], json!("Ada"));
    assert_eq!(record["type"], json!("User"));
    assert!(record.get("content").is_none());
}
