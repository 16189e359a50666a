// used for persistence
use std::collections::HashSet;
use std::panic::RefUnwindSafe;
use std::sync::Arc;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde_json::{Map, Number, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::event::{DEFAULT_CHANNEL, Notification};
use crate::predicate::{EVAL_FUNCTION, PLACEHOLDER};
use crate::record::RecordKind;
use crate::{DocstoreError, Result};

pub type Row = Map<String, Value>;

pub const SCHEMA_VERSION: i64 = 1;

// ------------- Collaborators -------------
/// One connection holding at most one open transaction.
pub trait Storage: Send {
    fn begin(&mut self) -> Result<()>;
    /// Runs one statement with positional `$n` parameters and returns its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    /// Rolls back anything still open and releases the connection. Called
    /// after every commit or rollback as well, so it must tolerate a
    /// finished transaction.
    fn disconnect(&mut self) -> Result<()>;
    fn listen(&mut self, channel: &str) -> Result<()>;
    fn unlisten(&mut self, channel: &str) -> Result<()>;
    /// Hands out the receiving end of the notification channel, once.
    fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        None
    }
}

pub trait Migrator {
    fn current_version(&mut self) -> Result<i64>;
    fn apply_migration(&mut self, step: i64) -> Result<()>;
    fn migrate(&mut self) -> Result<i64> {
        let mut version = self.current_version()?;
        while version < SCHEMA_VERSION {
            version += 1;
            self.apply_migration(version)?;
        }
        Ok(version)
    }
}

/// Runs the serialized predicate functions used by BIND.
pub trait Evaluator: Send + Sync + RefUnwindSafe {
    fn evaluate(&self, values: &[Value], source: &str, extra: &[Value]) -> Result<Value>;
}

impl<F> Evaluator for F
where
    F: Fn(&[Value], &str, &[Value]) -> Result<Value> + Send + Sync + RefUnwindSafe,
{
    fn evaluate(&self, values: &[Value], source: &str, extra: &[Value]) -> Result<Value> {
        self(values, source, extra)
    }
}

// ------------- Persistence -------------
const UUID_DEFAULT: &str = "(lower(hex(randomblob(4)) || '-' || hex(randomblob(2)) || '-4' || \
     substr(hex(randomblob(2)), 2) || '-' || substr('89ab', 1 + (abs(random()) % 4), 1) || \
     substr(hex(randomblob(2)), 2) || '-' || hex(randomblob(6))))";
const NOW: &str = "(strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))";

pub struct SqlitePersistor {
    db: Option<Connection>,
    in_transaction: bool,
    listening: HashSet<String>,
    sender: Option<mpsc::UnboundedSender<Notification>>,
    receiver: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl SqlitePersistor {
    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
    pub fn new(connection: Connection) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut persistor = SqlitePersistor {
            db: Some(connection),
            in_transaction: false,
            listening: HashSet::new(),
            sender: Some(sender),
            receiver: Some(receiver),
        };
        let version = persistor.migrate()?;
        debug!(version, "sqlite schema ready");
        Ok(persistor)
    }

    /// Registers the BIND evaluator as an SQL function.
    pub fn with_evaluator(self, evaluator: Arc<dyn Evaluator>) -> Result<Self> {
        self.db()?.create_scalar_function(
            EVAL_FUNCTION,
            3,
            FunctionFlags::SQLITE_UTF8,
            move |ctx: &Context<'_>| {
                let values = json_argument(ctx, 0)?;
                let source: String = ctx.get(1)?;
                let extra = json_argument(ctx, 2)?;
                let result = evaluator
                    .evaluate(&values, &source, &extra)
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
                Ok(to_sql(&result))
            },
        )?;
        Ok(self)
    }

    fn db(&self) -> Result<&Connection> {
        self.db
            .as_ref()
            .ok_or_else(|| DocstoreError::Execution("connection is closed".to_string()))
    }

    fn schema() -> String {
        let mut ddl = String::from(
            "
            create table if not exists tcn_queue (
                seq integer primary key autoincrement,
                channel text not null,
                payload text not null
            );
            ",
        );
        for kind in RecordKind::ALL {
            ddl.push_str(&Self::table(kind));
            ddl.push_str(&Self::touch_trigger(kind));
            if crate::event::event_name(kind.table(), crate::event::Op::Insert).is_some() {
                ddl.push_str(&Self::notify_triggers(kind));
            }
        }
        ddl
    }

    fn table(kind: RecordKind) -> String {
        use crate::record::ColumnType;
        let mut columns = Vec::new();
        for column in kind.columns() {
            let name = column.name;
            let definition = match (name, column.column_type) {
                ("id", _) => format!("{name} text not null primary key default {UUID_DEFAULT}"),
                (_, ColumnType::Timestamp) => format!("{name} text not null default {NOW}"),
                ("name", _) if matches!(kind, RecordKind::Type | RecordKind::Lib) => {
                    format!("{name} text not null unique")
                }
                ("version", _) => format!("{name} integer not null"),
                (_, ColumnType::Json) => {
                    format!("{name} text not null default '{{}}' check (json_valid({name}))")
                }
                (_, ColumnType::Integer) => format!("{name} integer null"),
                (_, ColumnType::Text) => format!("\"{name}\" text null"),
            };
            columns.push(definition);
        }
        format!(
            "create table if not exists \"{}\" (\n    {}\n);\n",
            kind.table(),
            columns.join(",\n    ")
        )
    }

    fn touch_trigger(kind: RecordKind) -> String {
        if !kind.is_reserved("modified") {
            return String::new();
        }
        let table = kind.table();
        format!(
            "create trigger if not exists {table}_touch after update on \"{table}\"
            for each row when new.modified = old.modified begin
                update \"{table}\" set modified = {NOW} where id = new.id;
            end;\n"
        )
    }

    fn notify_triggers(kind: RecordKind) -> String {
        let table = kind.table();
        let mut ddl = String::new();
        for (op, when, row) in [("I", "insert", "new"), ("U", "update", "new"), ("D", "delete", "old")] {
            // the touch trigger's own update must not notify twice
            let condition = if op == "U" { "when new.modified is old.modified" } else { "" };
            let payload = format!(
                "'\"{table}\",{op},\"id\"=''' || replace({row}.id, '''', '''''') || ''''"
            );
            let typed = if kind.is_reserved("type") {
                format!(
                    "insert into tcn_queue (channel, payload)
                        select '{DEFAULT_CHANNEL}' || lower({row}.\"type\"), {payload}
                        where {row}.\"type\" is not null;"
                )
            } else {
                String::new()
            };
            ddl.push_str(&format!(
                "create trigger if not exists {table}_tcn_{when} after {when} on \"{table}\"
                for each row {condition} begin
                    insert into tcn_queue (channel, payload) values ('{DEFAULT_CHANNEL}', {payload});
                    {typed}
                end;\n"
            ));
        }
        ddl
    }

    fn drain_queue(&mut self) -> Result<Vec<Notification>> {
        let db = self.db()?;
        let mut statement = db.prepare("select channel, payload from tcn_queue order by seq")?;
        let queued = statement
            .query_map([], |r| Ok(Notification::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        db.execute("delete from tcn_queue", [])?;
        Ok(queued)
    }
}

impl Migrator for SqlitePersistor {
    fn current_version(&mut self) -> Result<i64> {
        let db = self.db()?;
        let exists: i64 = db.query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'dbversion'",
            [],
            |r| r.get(0),
        )?;
        if exists == 0 {
            return Ok(0);
        }
        Ok(db.query_row("select coalesce(max(version), 0) from dbversion", [], |r| r.get(0))?)
    }
    fn apply_migration(&mut self, step: i64) -> Result<()> {
        match step {
            1 => {
                let db = self.db()?;
                db.execute_batch(&Self::schema())?;
                db.execute("insert into dbversion (version) values (?1)", [step])?;
                info!(step, "applied migration");
                Ok(())
            }
            other => Err(DocstoreError::NotFound(format!("migration step {other}"))),
        }
    }
}

impl Storage for SqlitePersistor {
    fn begin(&mut self) -> Result<()> {
        self.db()?.execute_batch("begin")?;
        self.in_transaction = true;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        // ?NNN binds the NNN-th parameter however often it appears
        let sql = PLACEHOLDER.replace_all(sql, "?$1");
        trace!(sql = %sql, "sqlite query");
        let db = self.db()?;
        let mut statement = db.prepare(&sql)?;
        let names: Vec<String> = statement.column_names().into_iter().map(String::from).collect();
        let mut rows = statement.query(params_from_iter(params.iter().map(to_sql)))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Map::new();
            for (i, name) in names.iter().enumerate() {
                record.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            result.push(record);
        }
        Ok(result)
    }

    /// Queued change notifications are delivered once the commit succeeds.
    fn commit(&mut self) -> Result<()> {
        let queued = self.drain_queue()?;
        self.db()?.execute_batch("commit")?;
        self.in_transaction = false;
        let Some(sender) = &self.sender else {
            return Ok(());
        };
        for notification in queued {
            if self.listening.contains(&notification.channel) {
                // nobody holding the receiver is not an error
                let _ = sender.send(notification);
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.db()?.execute_batch("rollback")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.rollback()?;
        if let Some(db) = self.db.take() {
            db.close().map_err(|(_, e)| DocstoreError::from(e))?;
        }
        self.listening.clear();
        // the receiver still drains what was already sent
        self.sender = None;
        Ok(())
    }

    fn listen(&mut self, channel: &str) -> Result<()> {
        self.listening.insert(channel.to_string());
        Ok(())
    }

    fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.listening.remove(channel);
        Ok(())
    }

    fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.receiver.take()
    }
}

fn json_argument(ctx: &Context<'_>, index: usize) -> rusqlite::Result<Vec<Value>> {
    let text: String = ctx.get(index)?;
    match serde_json::from_str(&text) {
        Ok(Value::Array(values)) => Ok(values),
        Ok(other) => Ok(vec![other]),
        Err(e) => Err(rusqlite::Error::UserFunctionError(Box::new(e))),
    }
}

pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{byte:02x}")).collect()),
    }
}
