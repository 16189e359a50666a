use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use docstore::graph::{compact_value, expand_value};
use docstore::predicate::Dialect;
use docstore::query::{Query, Traits};
use docstore::record::{RecordKind, TypeSchema};
use serde_json::{Value, json};

// a document where every member also shows up in a lookup index
fn document(members: usize) -> Value {
    let people: Vec<Value> = (0..members)
        .map(|n| json!({"id": format!("u{n}"), "name": format!("user {n}")}))
        .collect();
    let index: serde_json::Map<String, Value> = (0..members)
        .map(|n| (format!("u{n}"), json!({"id": format!("u{n}"), "age": n})))
        .collect();
    json!({"id": "d1", "members": people, "index": index})
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let schema = TypeSchema::new(json!({"properties": {"age": {"type": "number"}}}));
    let traits = Traits::from_value(json!({
        "fields": ["$id", "name", "address.zip"],
        "order": [["age", "DESC"]],
        "limit": 50
    }))
    .unwrap();
    let dsl = json!(["OR",
        {"$type": "User", "age": 30},
        ["AND", {"address.zip": 12345}, ["BIND", "age", {"$fn": "a => a > 1"}]]
    ]);
    c.bench_function("compile query", |b| {
        b.iter(|| {
            Query::from_traits(RecordKind::Document, &schema, Dialect::Postgres, black_box(&dsl), &traits)
                .and_then(|query| query.compile())
        })
    });

    for members in [10, 1000] {
        let doc = document(members);
        c.bench_function(&format!("compact {members}"), |b| {
            b.iter(|| compact_value(black_box(&doc)))
        });
        let compacted = compact_value(&doc).unwrap();
        c.bench_function(&format!("expand {members}"), |b| {
            b.iter(|| expand_value(black_box(&compacted)))
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
