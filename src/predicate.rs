//! Compiles the JSON query DSL into parameterized SQL fragments.
//!
//! A DSL node is one of:
//! * an object `{key: value, ...}`: one equality per entry, joined with the
//!   caller's default operator (`AND`, or `OR` when matching any);
//! * an array `[op?, node, node, ...]` where `op` is `AND`, `OR` or
//!   `BIND[:returnType]` (default `AND`);
//! * `null`, which matches everything.
//!
//! Keys starting with `$` address a reserved column (`$id`, `$created:ms`);
//! any other key is a dotted path into the record's JSON payload. Payload key
//! names are always bound as parameters.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::{ColumnType, RecordKind, TypeSchema};
use crate::{DocstoreError, Result};

pub const RESERVED_MARKER: char = '$';
pub const FUNCTION_KEY: &str = "$fn";
pub const RELATED_KEY: &str = "$related";
pub const EVAL_FUNCTION: &str = "docstore_eval";
pub const RELATED_FUNCTION: &str = "docstore_related";
const EPOCH_MS_SUFFIX: &str = ":ms";

lazy_static! {
    pub(crate) static ref PLACEHOLDER: Regex = Regex::new(r"\$(\d+)").unwrap();
    static ref PAYLOAD_KEY: Regex = Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)*$").unwrap();
    static ref INVERSE_PROPERTY: Regex =
        Regex::new(r"^([A-Za-z0-9_\-]+)\{([A-Za-z_][A-Za-z0-9_]*)#([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\}$").unwrap();
    static ref ORDER_TOKEN: Regex = Regex::new(r"(?i)^(ASC|DESC|NULLS|FIRST|LAST)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
}

// ------------- Predicate -------------
/// A compiled SQL fragment with its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    format: String,
    params: Vec<Value>,
    meta: Map<String, Value>,
}

impl Predicate {
    pub fn new(format: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            format: format.into(),
            params,
            meta: Map::new(),
        }
    }
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
    pub fn format(&self) -> &str {
        &self.format
    }
    pub fn params(&self) -> &[Value] {
        &self.params
    }
    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }
    pub fn is_empty(&self) -> bool {
        self.format.is_empty()
    }
    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.format, self.params)
    }

    /// `(a) op (b) ...`, parameters concatenated in the same order. Empty
    /// predicates are skipped.
    pub fn join(predicates: Vec<Predicate>, op: &str) -> Predicate {
        let mut formats = Vec::new();
        let mut params = Vec::new();
        for predicate in predicates.into_iter().filter(|p| !p.is_empty()) {
            formats.push(format!("({})", predicate.format));
            params.extend(predicate.params);
        }
        if formats.is_empty() {
            return Predicate::empty();
        }
        Predicate::new(formats.join(&format!(" {op} ")), params)
            .with_meta("operator", Value::String(op.to_string()))
    }

    /// The fragment with every placeholder replaced by the literal of its
    /// parameter, in textual order. Meant for logs and tests, never execution.
    pub fn render(&self) -> String {
        render_sql(&self.format, &self.params)
    }
}

pub fn render_sql(sql: &str, params: &[Value]) -> String {
    let mut next = 0;
    PLACEHOLDER
        .replace_all(sql, |_: &Captures| {
            let literal = params.get(next).map(sql_literal).unwrap_or_else(|| "?".to_string());
            next += 1;
            literal
        })
        .into_owned()
}

pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

// ------------- Fragment -------------
// Accumulates parameters while a fragment is written left to right. In
// inline mode values are written as literals instead (used for the column
// expressions shipped inside relation descriptions).
struct Fragment {
    params: Vec<Value>,
    inline: bool,
}

impl Fragment {
    fn new() -> Self {
        Self { params: Vec::new(), inline: false }
    }
    fn inline() -> Self {
        Self { params: Vec::new(), inline: true }
    }
    fn bind(&mut self, value: Value) -> String {
        if self.inline {
            return sql_literal(&value);
        }
        self.params.push(value);
        format!("${}", self.params.len())
    }
    fn finish(self, format: String) -> Predicate {
        Predicate::new(format, self.params)
    }
}

// ------------- Keys -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Column { name: String, column_type: ColumnType, epoch_ms: bool },
    Payload { path: Vec<String> },
}

impl Key {
    /// Attribute name as it appears on a resolved record.
    pub fn name(&self) -> String {
        match self {
            Key::Column { name, .. } => name.clone(),
            Key::Payload { path } => path.join("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cast {
    Direct,
    Text,
    Numeric,
    Boolean,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Bind(BindType),
}

impl Operator {
    pub fn parse(token: &str) -> Result<Self> {
        if token.eq_ignore_ascii_case("AND") {
            return Ok(Self::And);
        }
        if token.eq_ignore_ascii_case("OR") {
            return Ok(Self::Or);
        }
        match token.split_once(':') {
            None if token == "BIND" => Ok(Self::Bind(BindType::Boolean)),
            Some(("BIND", returns)) => Ok(Self::Bind(BindType::parse(returns)?)),
            _ => Err(DocstoreError::compile(format!("unknown operator token '{token}'"))),
        }
    }
    fn keyword(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Bind(_) => "BIND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindType {
    Boolean,
    Number,
    Text,
    Json,
}

impl BindType {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(Self::Boolean),
            "number" | "numeric" => Ok(Self::Number),
            "text" | "string" => Ok(Self::Text),
            "json" | "jsonb" => Ok(Self::Json),
            other => Err(DocstoreError::compile(format!("unknown BIND return type '{other}'"))),
        }
    }
    fn name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Where a selected field lands on the decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMapping {
    Column(String),
    Payload { attribute: String, path: Vec<String> },
    Related,
}

// ------------- Relations -------------
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datakey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InverseRelation {
    #[serde(rename = "type")]
    pub type_name: String,
    pub property: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub source_property: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse: Option<InverseRelation>,
    pub fields: Vec<FieldSpec>,
}

// ------------- Compiler -------------
pub struct PredicateCompiler<'a> {
    kind: RecordKind,
    schema: &'a TypeSchema,
    dialect: Dialect,
    match_any: bool,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(kind: RecordKind, schema: &'a TypeSchema, dialect: Dialect) -> Self {
        Self {
            kind,
            schema,
            dialect,
            match_any: false,
        }
    }
    pub fn match_any(mut self, match_any: bool) -> Self {
        self.match_any = match_any;
        self
    }
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
    fn default_operator(&self) -> &'static str {
        if self.match_any { "OR" } else { "AND" }
    }

    pub fn parse_key(&self, key: &str) -> Result<Key> {
        if let Some(column) = key.strip_prefix(RESERVED_MARKER) {
            let (name, epoch_ms) = match column.strip_suffix(EPOCH_MS_SUFFIX) {
                Some(name) => (name, true),
                None => (column, false),
            };
            let column = self
                .kind
                .columns()
                .into_iter()
                .find(|c| c.name == name)
                .ok_or_else(|| {
                    DocstoreError::compile(format!("'{key}' is not a column of {}", self.kind))
                })?;
            if epoch_ms && column.column_type != ColumnType::Timestamp {
                return Err(DocstoreError::compile(format!(
                    "'{key}' requests epoch milliseconds from a non-timestamp column"
                )));
            }
            return Ok(Key::Column {
                name: column.name.to_string(),
                column_type: column.column_type,
                epoch_ms,
            });
        }
        if !PAYLOAD_KEY.is_match(key) {
            return Err(DocstoreError::compile(format!("invalid key syntax '{key}'")));
        }
        Ok(Key::Payload {
            path: key.split('.').map(str::to_string).collect(),
        })
    }

    fn infer(&self, key: &Key) -> Cast {
        match key {
            Key::Column { .. } => Cast::Direct,
            Key::Payload { path } => {
                let path: Vec<&str> = path.iter().map(String::as_str).collect();
                match self.schema.property_type(&path) {
                    Some("number") | Some("integer") => Cast::Numeric,
                    Some("boolean") => Cast::Boolean,
                    Some("object") | Some("array") => Cast::Json,
                    _ => Cast::Text,
                }
            }
        }
    }

    /// Column or payload extraction; `raw` selects JSON over text extraction.
    fn extract(&self, fragment: &mut Fragment, key: &Key, raw: bool) -> String {
        match key {
            Key::Column { name, epoch_ms: false, .. } => quote_ident(name),
            Key::Column { name, epoch_ms: true, .. } => match self.dialect {
                Dialect::Postgres => {
                    format!("(extract(epoch from {}) * 1000)::bigint", quote_ident(name))
                }
                Dialect::Sqlite => format!(
                    "CAST((julianday({}) - 2440587.5) * 86400000 AS INTEGER)",
                    quote_ident(name)
                ),
            },
            Key::Payload { path } => {
                let payload = quote_ident(self.kind.payload());
                match (self.dialect, path.len()) {
                    (Dialect::Postgres, 1) => {
                        let operator = if raw { "->" } else { "->>" };
                        let key = fragment.bind(Value::String(path[0].clone()));
                        format!("{payload}{operator}{key}::text")
                    }
                    (Dialect::Postgres, _) => {
                        let operator = if raw { "#>" } else { "#>>" };
                        let key = fragment.bind(Value::String(format!("{{{}}}", path.join(","))));
                        format!("{payload}{operator}{key}::text[]")
                    }
                    (Dialect::Sqlite, _) => {
                        let operator = if raw { "->" } else { "->>" };
                        let key = fragment.bind(Value::String(sqlite_path(path)));
                        format!("{payload}{operator}{key}")
                    }
                }
            }
        }
    }

    fn cast_expression(&self, fragment: &mut Fragment, key: &Key, cast: Cast) -> String {
        match cast {
            Cast::Direct => self.extract(fragment, key, false),
            Cast::Json => self.extract(fragment, key, true),
            Cast::Text => {
                let text = self.extract(fragment, key, false);
                match self.dialect {
                    Dialect::Postgres => format!("({text})"),
                    Dialect::Sqlite => format!("CAST({text} AS TEXT)"),
                }
            }
            Cast::Numeric => {
                let text = self.extract(fragment, key, false);
                match self.dialect {
                    Dialect::Postgres => format!("({text})::numeric"),
                    Dialect::Sqlite => format!("CAST({text} AS NUMERIC)"),
                }
            }
            Cast::Boolean => {
                let text = self.extract(fragment, key, false);
                match self.dialect {
                    Dialect::Postgres => format!("({text})::boolean"),
                    Dialect::Sqlite => format!("CAST({text} AS INTEGER)"),
                }
            }
        }
    }

    fn bind_value(&self, fragment: &mut Fragment, value: &Value, cast: Cast) -> String {
        match (cast, self.dialect) {
            (Cast::Direct, _) => fragment.bind(value.clone()),
            (Cast::Text, _) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                fragment.bind(Value::String(text))
            }
            (Cast::Numeric, Dialect::Postgres) => format!("{}::numeric", fragment.bind(value.clone())),
            (Cast::Boolean, Dialect::Postgres) => format!("{}::boolean", fragment.bind(value.clone())),
            (Cast::Numeric | Cast::Boolean, Dialect::Sqlite) => fragment.bind(value.clone()),
            (Cast::Json, Dialect::Postgres) => {
                format!("{}::jsonb", fragment.bind(Value::String(value.to_string())))
            }
            (Cast::Json, Dialect::Sqlite) => {
                format!("json({})", fragment.bind(Value::String(value.to_string())))
            }
        }
    }

    // ---- predicates ----

    pub fn compile(&self, dsl: &Value) -> Result<Predicate> {
        match dsl {
            Value::Null => Ok(Predicate::empty()),
            Value::Object(entries) => self.compile_object(entries),
            Value::Array(items) => self.compile_array(items),
            other => Err(DocstoreError::compile(format!(
                "scalar {other} cannot be used as a predicate"
            ))),
        }
    }

    fn compile_object(&self, entries: &Map<String, Value>) -> Result<Predicate> {
        if entries.contains_key(FUNCTION_KEY) {
            return Err(DocstoreError::compile("function value outside of a BIND array"));
        }
        let mut predicates = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            predicates.push(self.compile_entry(key, value)?);
        }
        Ok(Predicate::join(predicates, self.default_operator()))
    }

    fn compile_entry(&self, key: &str, value: &Value) -> Result<Predicate> {
        let key = self.parse_key(key)?;
        let mut fragment = Fragment::new();
        let format = match value {
            Value::Null => format!("{} IS NULL", self.extract(&mut fragment, &key, false)),
            Value::Object(_) | Value::Array(_) => {
                let column = self.cast_expression(&mut fragment, &key, Cast::Json);
                let value = self.bind_value(&mut fragment, value, Cast::Json);
                format!("{column} = {value}")
            }
            scalar => {
                let cast = self.infer(&key);
                let column = self.cast_expression(&mut fragment, &key, cast);
                let value = self.bind_value(&mut fragment, scalar, cast);
                format!("{column} = {value}")
            }
        };
        Ok(fragment.finish(format))
    }

    fn compile_array(&self, items: &[Value]) -> Result<Predicate> {
        let (operator, rest) = match items.first() {
            Some(Value::String(token)) => (Operator::parse(token)?, &items[1..]),
            _ => (Operator::And, items),
        };
        match operator {
            Operator::Bind(returns) => self.compile_bind(rest, returns),
            _ => {
                let mut predicates = Vec::with_capacity(rest.len());
                for item in rest {
                    if item.is_string() {
                        return Err(DocstoreError::compile(format!(
                            "unexpected token {item} inside an {} array",
                            operator.keyword()
                        )));
                    }
                    predicates.push(self.compile(item)?);
                }
                Ok(Predicate::join(predicates, operator.keyword()))
            }
        }
    }

    /// `[key, key, ..., {"$fn": source}, param, ...]` as a call to the
    /// external evaluator, cast to the requested return type.
    fn compile_bind(&self, items: &[Value], returns: BindType) -> Result<Predicate> {
        let position = items
            .iter()
            .position(is_function)
            .ok_or_else(|| DocstoreError::compile("BIND array without a predicate function"))?;
        let source = items[position]
            .get(FUNCTION_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let extra = Value::Array(items[position + 1..].to_vec());

        let mut fragment = Fragment::new();
        let mut inputs = Vec::with_capacity(position);
        for input in &items[..position] {
            let key = input.as_str().ok_or_else(|| {
                DocstoreError::compile(format!("BIND input {input} is not a key"))
            })?;
            let key = self.parse_key(key)?;
            inputs.push(self.extract(&mut fragment, &key, self.dialect == Dialect::Postgres));
        }
        let call = match self.dialect {
            Dialect::Postgres => {
                let values = format!("jsonb_build_array({})", inputs.join(", "));
                let source = fragment.bind(Value::String(source));
                let extra = fragment.bind(Value::String(extra.to_string()));
                let call = format!("{EVAL_FUNCTION}({values}, {source}::text, {extra}::jsonb)");
                match returns {
                    BindType::Boolean => format!("({call})::boolean"),
                    BindType::Number => format!("({call})::numeric"),
                    BindType::Text => format!("({call})::text"),
                    BindType::Json => format!("({call})::jsonb"),
                }
            }
            Dialect::Sqlite => {
                let values = format!("json_array({})", inputs.join(", "));
                let source = fragment.bind(Value::String(source));
                let extra = fragment.bind(Value::String(extra.to_string()));
                let call = format!("{EVAL_FUNCTION}({values}, {source}, {extra})");
                match returns {
                    BindType::Boolean => format!("CAST({call} AS INTEGER)"),
                    BindType::Number => format!("CAST({call} AS NUMERIC)"),
                    BindType::Text => format!("CAST({call} AS TEXT)"),
                    BindType::Json => call,
                }
            }
        };
        Ok(fragment
            .finish(call)
            .with_meta("operator", Value::String("BIND".to_string()))
            .with_meta("returns", Value::String(returns.name().to_string())))
    }

    // ---- ordering, grouping ----

    /// `key`, `[key, tokens...]` or `[[BIND...], tokens...]`.
    pub fn compile_order(&self, entry: &Value) -> Result<Predicate> {
        let (head, tokens) = match entry {
            Value::String(_) => (entry, &[][..]),
            Value::Array(items) if !items.is_empty() => (&items[0], &items[1..]),
            other => {
                return Err(DocstoreError::compile(format!("invalid ordering entry {other}")));
            }
        };
        let mut predicate = match head {
            Value::String(key) => {
                let key = self.parse_key(key)?;
                let mut fragment = Fragment::new();
                let cast = self.infer(&key);
                let expression = self.cast_expression(&mut fragment, &key, cast);
                fragment.finish(expression)
            }
            Value::Array(_) => self.compile(head)?,
            other => {
                return Err(DocstoreError::compile(format!("invalid ordering key {other}")));
            }
        };
        for token in tokens {
            let token = token
                .as_str()
                .filter(|t| ORDER_TOKEN.is_match(t))
                .ok_or_else(|| DocstoreError::compile(format!("invalid ordering token {token}")))?;
            predicate.format.push(' ');
            predicate.format.push_str(&token.to_ascii_uppercase());
        }
        Ok(predicate)
    }

    // ---- fields ----

    /// A selectable field: a key, or `{"$related": [relation, ...]}`.
    pub fn compile_field(&self, field: &Value) -> Result<(Predicate, FieldMapping)> {
        match field {
            Value::String(key) => {
                let key = self.parse_key(key)?;
                let mut fragment = Fragment::new();
                let expression = self.extract(&mut fragment, &key, true);
                let mapping = match &key {
                    Key::Column { name, .. } => FieldMapping::Column(name.clone()),
                    Key::Payload { path } => FieldMapping::Payload {
                        attribute: self.kind.payload().to_string(),
                        path: path.clone(),
                    },
                };
                Ok((fragment.finish(expression), mapping))
            }
            Value::Object(entries) => match entries.get(RELATED_KEY) {
                Some(Value::Array(relations)) if entries.len() == 1 => {
                    Ok((self.compile_relations(relations)?, FieldMapping::Related))
                }
                _ => Err(DocstoreError::compile(format!("invalid field {field}"))),
            },
            other => Err(DocstoreError::compile(format!("invalid field {other}"))),
        }
    }

    pub fn compile_relations(&self, relations: &[Value]) -> Result<Predicate> {
        let mut compiled = Vec::with_capacity(relations.len());
        for relation in relations {
            compiled.push(self.relation(relation)?);
        }
        let description = serde_json::to_string(&compiled)?;
        let mut fragment = Fragment::new();
        let payload = quote_ident(self.kind.payload());
        let format = match self.dialect {
            Dialect::Postgres => format!(
                "{RELATED_FUNCTION}(\"id\", {payload}, {}::jsonb)",
                fragment.bind(Value::String(description))
            ),
            Dialect::Sqlite => format!(
                "{RELATED_FUNCTION}(\"id\", {payload}, {})",
                fragment.bind(Value::String(description))
            ),
        };
        Ok(fragment
            .finish(format)
            .with_meta("relations", Value::from(compiled.len())))
    }

    fn relation(&self, relation: &Value) -> Result<Relation> {
        let source = relation
            .get("sourceProperty")
            .and_then(Value::as_str)
            .ok_or_else(|| DocstoreError::compile(format!("relation {relation} lacks a sourceProperty")))?;
        let mut type_name = relation.get("type").and_then(Value::as_str).map(str::to_string);
        let (source_property, inverse) = match INVERSE_PROPERTY.captures(source) {
            Some(captures) => {
                let related = captures[2].to_string();
                if type_name.is_none() {
                    type_name = Some(related.clone());
                }
                (
                    captures[1].to_string(),
                    Some(InverseRelation {
                        type_name: related,
                        property: captures[3].to_string(),
                    }),
                )
            }
            None => {
                self.parse_key(source)?;
                (source.to_string(), None)
            }
        };
        // related rows are typed by their own schema, so fields go out uncast
        let related = PredicateCompiler::new(RecordKind::Document, &EMPTY_SCHEMA, self.dialect);
        let mut fields = Vec::new();
        for field in relation.get("fields").and_then(Value::as_array).into_iter().flatten() {
            let key = field
                .as_str()
                .ok_or_else(|| DocstoreError::compile(format!("relation field {field} is not a key")))?;
            let key = related.parse_key(key)?;
            let mut fragment = Fragment::inline();
            let query = related.extract(&mut fragment, &key, true);
            let (datakey, key_name) = match &key {
                Key::Column { .. } => (None, None),
                Key::Payload { path } => (Some(RecordKind::Document.payload().to_string()), Some(path.join("."))),
            };
            fields.push(FieldSpec {
                name: key.name(),
                datakey,
                key: key_name,
                query,
            });
        }
        Ok(Relation {
            type_name,
            source_property,
            inverse,
            fields,
        })
    }
}

lazy_static! {
    static ref EMPTY_SCHEMA: TypeSchema = TypeSchema::empty();
}

fn is_function(value: &Value) -> bool {
    matches!(value.get(FUNCTION_KEY), Some(Value::String(_)))
}

fn sqlite_path(path: &[String]) -> String {
    let mut out = String::from("$");
    for segment in path {
        if segment.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(&format!("[{segment}]"));
        } else {
            out.push_str(&format!(".\"{segment}\""));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sqlite_paths_quote_labels_and_index_arrays() {
        let path = vec!["items".to_string(), "0".to_string(), "a-b".to_string()];
        assert_eq!(sqlite_path(&path), "$.\"items\"[0].\"a-b\"");
    }

    #[test]
    fn inline_fragment_writes_literals() {
        let mut fragment = Fragment::inline();
        assert_eq!(fragment.bind(json!("it's")), "'it''s'");
        assert!(fragment.params.is_empty());
    }

    #[test]
    fn operator_tokens() {
        assert_eq!(Operator::parse("or").unwrap(), Operator::Or);
        assert_eq!(Operator::parse("BIND").unwrap(), Operator::Bind(BindType::Boolean));
        assert_eq!(Operator::parse("BIND:number").unwrap(), Operator::Bind(BindType::Number));
        assert!(Operator::parse("XOR").unwrap_err().is_compile());
        assert!(Operator::parse("BIND:date").unwrap_err().is_compile());
    }
}
