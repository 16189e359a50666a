//! Typed records.
//!
//! Every table managed by the store holds one record kind. A record has a fixed
//! set of reserved top-level attributes (backed by real columns) and one
//! free-form JSON payload column. Loading flattens the payload onto the record
//! ([`RecordKind::resolve`]); saving moves every non-reserved attribute back
//! into the payload ([`RecordKind::unresolve`]).

use std::fmt;

use serde_json::{Map, Value};

use crate::{DocstoreError, Result};

pub const IDENTITY: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn column(name: &'static str, column_type: ColumnType) -> Column {
    Column { name, column_type }
}

const ID: Column = column("id", ColumnType::Text);
const CREATED: Column = column("created", ColumnType::Timestamp);
const MODIFIED: Column = column("modified", ColumnType::Timestamp);
const NAME: Column = column("name", ColumnType::Text);
const TYPE: Column = column("type", ColumnType::Text);
const CODE: Column = column("code", ColumnType::Text);

/// The capability set shared by every record kind.
pub trait TypedRecord {
    // static stuff which needs to be implemented downstream
    const TABLE: &'static str;
    const RESERVED: &'static [Column];
    const PAYLOAD: &'static str;
}

// ------------- Record kinds -------------
pub struct Document;
pub struct Type;
pub struct Attachment;
pub struct Lib;
pub struct Method;
pub struct View;
pub struct DbVersion;

impl TypedRecord for Document {
    const TABLE: &'static str = "document";
    const RESERVED: &'static [Column] = &[ID, CREATED, MODIFIED, TYPE];
    const PAYLOAD: &'static str = "content";
}
impl TypedRecord for Type {
    const TABLE: &'static str = "type";
    const RESERVED: &'static [Column] =
        &[ID, CREATED, MODIFIED, NAME, column("schema", ColumnType::Json)];
    const PAYLOAD: &'static str = "meta";
}
impl TypedRecord for Attachment {
    const TABLE: &'static str = "attachment";
    const RESERVED: &'static [Column] = &[
        ID,
        CREATED,
        MODIFIED,
        column("document", ColumnType::Text),
        NAME,
        column("mimetype", ColumnType::Text),
        column("size", ColumnType::Integer),
    ];
    const PAYLOAD: &'static str = "meta";
}
impl TypedRecord for Lib {
    const TABLE: &'static str = "lib";
    const RESERVED: &'static [Column] = &[ID, CREATED, MODIFIED, NAME, CODE];
    const PAYLOAD: &'static str = "meta";
}
impl TypedRecord for Method {
    const TABLE: &'static str = "method";
    const RESERVED: &'static [Column] = &[ID, CREATED, MODIFIED, TYPE, NAME, CODE];
    const PAYLOAD: &'static str = "meta";
}
impl TypedRecord for View {
    const TABLE: &'static str = "view";
    const RESERVED: &'static [Column] =
        &[ID, CREATED, MODIFIED, TYPE, NAME, column("query", ColumnType::Json)];
    const PAYLOAD: &'static str = "meta";
}
impl TypedRecord for DbVersion {
    const TABLE: &'static str = "dbversion";
    const RESERVED: &'static [Column] = &[ID, CREATED, column("version", ColumnType::Integer)];
    const PAYLOAD: &'static str = "meta";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Document,
    Type,
    Attachment,
    Lib,
    Method,
    View,
    DbVersion,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        Self::Document,
        Self::Type,
        Self::Attachment,
        Self::Lib,
        Self::Method,
        Self::View,
        Self::DbVersion,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Self::Document => Document::TABLE,
            Self::Type => Type::TABLE,
            Self::Attachment => Attachment::TABLE,
            Self::Lib => Lib::TABLE,
            Self::Method => Method::TABLE,
            Self::View => View::TABLE,
            Self::DbVersion => DbVersion::TABLE,
        }
    }
    pub fn reserved(&self) -> &'static [Column] {
        match self {
            Self::Document => Document::RESERVED,
            Self::Type => Type::RESERVED,
            Self::Attachment => Attachment::RESERVED,
            Self::Lib => Lib::RESERVED,
            Self::Method => Method::RESERVED,
            Self::View => View::RESERVED,
            Self::DbVersion => DbVersion::RESERVED,
        }
    }
    pub fn payload(&self) -> &'static str {
        match self {
            Self::Document => Document::PAYLOAD,
            Self::Type => Type::PAYLOAD,
            Self::Attachment => Attachment::PAYLOAD,
            Self::Lib => Lib::PAYLOAD,
            Self::Method => Method::PAYLOAD,
            Self::View => View::PAYLOAD,
            Self::DbVersion => DbVersion::PAYLOAD,
        }
    }
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.table() == table)
    }
    pub fn column(&self, name: &str) -> Option<Column> {
        self.reserved().iter().copied().find(|c| c.name == name)
    }
    pub fn is_reserved(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
    /// Reserved columns followed by the payload column, in storage order.
    pub fn columns(&self) -> Vec<Column> {
        let mut columns = self.reserved().to_vec();
        columns.push(column(self.payload(), ColumnType::Json));
        columns
    }
    /// Columns a caller may write; identity and timestamps are owned by the store.
    pub fn writable(&self, name: &str) -> bool {
        !matches!(name, "id" | "created" | "modified")
    }

    /// Flattens the payload onto the record. Payload keys never shadow
    /// reserved attributes.
    pub fn resolve(&self, mut row: Map<String, Value>) -> Map<String, Value> {
        let payload = row.remove(self.payload());
        if let Some(Value::Object(payload)) = payload {
            for (key, value) in payload {
                if self.is_reserved(&key) || row.contains_key(&key) {
                    continue;
                }
                row.insert(key, value);
            }
        }
        row
    }

    /// Splits a flat record into reserved columns plus the payload object.
    /// An explicit payload attribute is merged first, then overridden by
    /// loose attributes; reserved names found inside it are dropped.
    pub fn unresolve(&self, record: &Map<String, Value>) -> Map<String, Value> {
        let mut row = Map::new();
        let mut payload = Map::new();
        if let Some(Value::Object(explicit)) = record.get(self.payload()) {
            for (key, value) in explicit {
                if !self.is_reserved(key) {
                    payload.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in record {
            if key == self.payload() {
                continue;
            }
            if self.is_reserved(key) {
                row.insert(key.clone(), value.clone());
            } else {
                payload.insert(key.clone(), value.clone());
            }
        }
        row.insert(self.payload().to_string(), Value::Object(payload));
        row
    }

    /// Normalizes a raw storage row: JSON columns delivered as text are
    /// parsed back into values.
    pub fn decode_row(&self, mut row: Map<String, Value>) -> Result<Map<String, Value>> {
        for column in self.columns() {
            if column.column_type != ColumnType::Json {
                continue;
            }
            if let Some(Value::String(text)) = row.get(column.name) {
                let parsed: Value = serde_json::from_str(text).map_err(|e| {
                    DocstoreError::Json(format!("column '{}' of {}: {}", column.name, self, e))
                })?;
                row.insert(column.name.to_string(), parsed);
            }
        }
        Ok(row)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.table())
    }
}

// ------------- Type schema -------------
/// The `schema` attribute of a Type record, used for payload type inference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeSchema {
    schema: Value,
}

impl TypeSchema {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }
    pub fn empty() -> Self {
        Self { schema: Value::Null }
    }
    /// `schema.properties[a].properties[b]...type` for a dotted path.
    pub fn property_type(&self, path: &[&str]) -> Option<&str> {
        let mut node = &self.schema;
        for segment in path {
            node = node.get("properties")?.get(*segment)?;
        }
        node.get("type")?.as_str()
    }
    pub fn as_value(&self) -> &Value {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn resolve_flattens_without_shadowing() {
        let row = map(json!({"id": "a", "type": "t", "content": {"name": "x", "id": "evil"}}));
        let resolved = RecordKind::Document.resolve(row);
        assert_eq!(Value::Object(resolved), json!({"id": "a", "type": "t", "name": "x"}));
    }

    #[test]
    fn unresolve_partitions_attributes() {
        let record = map(json!({"id": "a", "name": "x", "content": {"age": 3, "type": "no"}}));
        let row = RecordKind::Document.unresolve(&record);
        assert_eq!(Value::Object(row), json!({"id": "a", "content": {"age": 3, "name": "x"}}));
    }

    #[test]
    fn nested_property_types() {
        let schema = TypeSchema::new(json!({
            "properties": {"age": {"type": "number"}, "address": {"properties": {"zip": {"type": "integer"}}}}
        }));
        assert_eq!(schema.property_type(&["age"]), Some("number"));
        assert_eq!(schema.property_type(&["address", "zip"]), Some("integer"));
        assert_eq!(schema.property_type(&["missing"]), None);
    }
}
