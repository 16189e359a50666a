//! Accumulates compiled predicates into one SELECT statement.
//!
//! Fragments carry their own local `$n` numbering; [`Query::compile`]
//! renumbers every placeholder left to right, so the accumulation order of
//! fields, where, group and order parts must match their textual order.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::predicate::{
    Dialect, FieldMapping, PLACEHOLDER, Predicate, PredicateCompiler, RELATED_KEY, quote_ident,
    render_sql,
};
use crate::record::{RecordKind, TypeSchema};
use crate::{DocstoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "Value")]
pub enum Limit {
    #[default]
    All,
    Rows(u64),
}

impl TryFrom<Value> for Limit {
    type Error = String;
    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match &value {
            Value::Null => Ok(Limit::All),
            Value::String(s) if s.eq_ignore_ascii_case("ALL") => Ok(Limit::All),
            Value::Number(n) => n
                .as_u64()
                .map(Limit::Rows)
                .ok_or_else(|| format!("invalid limit {value}")),
            _ => Err(format!("invalid limit {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(try_from = "Value")]
pub enum FieldSelection {
    #[default]
    All,
    List(Vec<Value>),
}

impl TryFrom<Value> for FieldSelection {
    type Error = String;
    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(FieldSelection::All),
            Value::String(s) if s.eq_ignore_ascii_case("all") => Ok(FieldSelection::All),
            Value::Array(items) => Ok(FieldSelection::List(items)),
            other => Err(format!("invalid field selection {other}")),
        }
    }
}

/// Which fields, ordering, grouping and pagination a search uses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Traits {
    pub fields: FieldSelection,
    pub order: Vec<Value>,
    pub group: Vec<Value>,
    pub limit: Limit,
    pub offset: Option<u64>,
    pub count: bool,
    pub match_any: bool,
}

impl Default for Traits {
    fn default() -> Self {
        Self {
            fields: FieldSelection::All,
            order: vec![json!(["$created"])],
            group: Vec::new(),
            limit: Limit::All,
            offset: None,
            count: false,
            match_any: false,
        }
    }
}

impl Traits {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
    pub fn counting() -> Self {
        Self {
            count: true,
            ..Self::default()
        }
    }
}

// ------------- Query -------------
#[derive(Debug, Clone)]
pub struct Query {
    kind: RecordKind,
    dialect: Dialect,
    fields: Vec<Predicate>,
    field_map: Vec<(String, FieldMapping)>,
    wheres: Vec<Predicate>,
    groups: Vec<Predicate>,
    orders: Vec<Predicate>,
    limit: Limit,
    offset: Option<u64>,
    count: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub field_map: Vec<(String, FieldMapping)>,
    pub result_kind: RecordKind,
    pub count: bool,
    pub dialect: Dialect,
}

impl Query {
    pub fn new(kind: RecordKind, dialect: Dialect) -> Self {
        Self {
            kind,
            dialect,
            fields: Vec::new(),
            field_map: Vec::new(),
            wheres: Vec::new(),
            groups: Vec::new(),
            orders: Vec::new(),
            limit: Limit::All,
            offset: None,
            count: false,
        }
    }

    /// Builds the query a search with `traits` over `dsl` describes.
    pub fn from_traits(
        kind: RecordKind,
        schema: &TypeSchema,
        dialect: Dialect,
        dsl: &Value,
        traits: &Traits,
    ) -> Result<Self> {
        let compiler = PredicateCompiler::new(kind, schema, dialect).match_any(traits.match_any);
        let mut query = Self::new(kind, dialect);
        match &traits.fields {
            FieldSelection::All => {
                query.all_fields();
            }
            FieldSelection::List(fields) => {
                for field in fields {
                    let (expression, mapping) = compiler.compile_field(field)?;
                    query.field(expression, mapping);
                }
            }
        }
        query.filter(compiler.compile(dsl)?);
        for entry in &traits.group {
            query.group(compiler.compile_order(entry)?);
        }
        for entry in &traits.order {
            query.order(compiler.compile_order(entry)?);
        }
        query.limit(traits.limit).offset(traits.offset).count(traits.count);
        Ok(query)
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn field(&mut self, expression: Predicate, mapping: FieldMapping) -> &mut Self {
        let alias = match &mapping {
            FieldMapping::Column(name) => name.clone(),
            FieldMapping::Payload { .. } => format!("_f{}", self.fields.len()),
            FieldMapping::Related => RELATED_KEY.to_string(),
        };
        let (format, params) = expression.into_parts();
        self.fields
            .push(Predicate::new(format!("{format} AS {}", quote_ident(&alias)), params));
        self.field_map.push((alias, mapping));
        self
    }
    pub fn all_fields(&mut self) -> &mut Self {
        for column in self.kind.columns() {
            self.field(
                Predicate::new(quote_ident(column.name), Vec::new()),
                FieldMapping::Column(column.name.to_string()),
            );
        }
        self
    }
    pub fn filter(&mut self, predicate: Predicate) -> &mut Self {
        if !predicate.is_empty() {
            self.wheres.push(predicate);
        }
        self
    }
    pub fn group(&mut self, predicate: Predicate) -> &mut Self {
        self.groups.push(predicate);
        self
    }
    pub fn order(&mut self, predicate: Predicate) -> &mut Self {
        self.orders.push(predicate);
        self
    }
    pub fn limit(&mut self, limit: Limit) -> &mut Self {
        self.limit = limit;
        self
    }
    pub fn offset(&mut self, offset: Option<u64>) -> &mut Self {
        self.offset = offset;
        self
    }
    pub fn count(&mut self, count: bool) -> &mut Self {
        self.count = count;
        self
    }

    /// Count mode selects a single aggregate and drops ordering and paging.
    pub fn compile(&self) -> Result<CompiledQuery> {
        if !self.count && self.fields.is_empty() {
            return Err(DocstoreError::compile("a query needs at least one field"));
        }
        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");
        if self.count {
            sql.push_str("COUNT(*) AS \"count\"");
        } else {
            sql.push_str(&Self::list(&self.fields, &mut params));
        }
        sql.push_str(" FROM ");
        sql.push_str(&quote_ident(self.kind.table()));
        if !self.wheres.is_empty() {
            let (format, where_params) = Predicate::join(self.wheres.clone(), "AND").into_parts();
            sql.push_str(" WHERE ");
            sql.push_str(&format);
            params.extend(where_params);
        }
        if !self.groups.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&Self::list(&self.groups, &mut params));
        }
        if !self.count {
            if !self.orders.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&Self::list(&self.orders, &mut params));
            }
            match (self.limit, self.dialect) {
                (Limit::Rows(rows), _) => sql.push_str(&format!(" LIMIT {rows}")),
                (Limit::All, Dialect::Postgres) => sql.push_str(" LIMIT ALL"),
                (Limit::All, Dialect::Sqlite) => sql.push_str(" LIMIT -1"),
            }
            if let Some(offset) = self.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        let (sql, placeholders) = renumber(&sql);
        if placeholders != params.len() {
            return Err(DocstoreError::Invariant(format!(
                "{placeholders} placeholders for {} parameters in: {sql}",
                params.len()
            )));
        }
        debug!(sql = %render_sql(&sql, &params), "compiled query");
        Ok(CompiledQuery {
            sql,
            params,
            field_map: if self.count { Vec::new() } else { self.field_map.clone() },
            result_kind: self.kind,
            count: self.count,
            dialect: self.dialect,
        })
    }

    fn list(predicates: &[Predicate], params: &mut Vec<Value>) -> String {
        let mut formats = Vec::with_capacity(predicates.len());
        for predicate in predicates {
            formats.push(predicate.format().to_string());
            params.extend(predicate.params().iter().cloned());
        }
        formats.join(", ")
    }
}

/// Rewrites `$n` placeholders as `$1, $2, ...` in textual order.
pub fn renumber(sql: &str) -> (String, usize) {
    let mut next = 0;
    let renumbered = PLACEHOLDER
        .replace_all(sql, |_: &regex::Captures| {
            next += 1;
            format!("${next}")
        })
        .into_owned();
    (renumbered, next)
}

impl CompiledQuery {
    /// Re-nests one result row into a resolved record (or the bare count).
    pub fn decode(&self, row: Map<String, Value>) -> Result<Value> {
        if self.count {
            return Ok(row.get("count").cloned().unwrap_or(Value::from(0)));
        }
        let mut record = Map::new();
        for (alias, mapping) in &self.field_map {
            let value = row.get(alias).cloned().unwrap_or(Value::Null);
            match mapping {
                FieldMapping::Column(name) => {
                    record.insert(name.clone(), value);
                }
                FieldMapping::Payload { attribute, path } => {
                    let value = self.raw_json(value);
                    let slot = record
                        .entry(attribute.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    nest(slot, path, value);
                }
                FieldMapping::Related => {
                    record.insert(RELATED_KEY.to_string(), self.raw_json(value));
                }
            }
        }
        let record = self.result_kind.decode_row(record)?;
        Ok(Value::Object(self.result_kind.resolve(record)))
    }

    // SQLite hands JSON extractions back as text
    fn raw_json(&self, value: Value) -> Value {
        match (self.dialect, value) {
            (Dialect::Sqlite, Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            (_, value) => value,
        }
    }

    pub fn render(&self) -> String {
        render_sql(&self.sql, &self.params)
    }
}

fn nest(slot: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *slot = value;
        return;
    };
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        nest(map.entry(first.clone()).or_insert(Value::Null), rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renumber_counts_in_textual_order() {
        let (sql, count) = renumber("a = $1 AND b = $1 OR c = $7");
        assert_eq!(sql, "a = $1 AND b = $2 OR c = $3");
        assert_eq!(count, 3);
    }

    #[test]
    fn nest_builds_intermediate_objects() {
        let mut slot = json!({});
        nest(&mut slot, &["a".to_string(), "b".to_string()], json!(1));
        nest(&mut slot, &["c".to_string()], json!(2));
        assert_eq!(slot, json!({"a": {"b": 1}, "c": 2}));
    }

    #[test]
    fn limit_sentinels() {
        assert_eq!(Limit::try_from(json!("ALL")).unwrap(), Limit::All);
        assert_eq!(Limit::try_from(json!(5)).unwrap(), Limit::Rows(5));
        assert!(Limit::try_from(json!(-1)).is_err());
    }
}
