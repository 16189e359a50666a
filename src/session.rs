//! One logical database session.
//!
//! A [`Session`] owns a single storage connection with one open transaction.
//! Every operation goes through [`Session::run`], which refuses to touch a
//! terminal session, times the call, pushes the inactivity deadline forward,
//! and fails the call if the watchdog rolled the transaction back while it was
//! in flight. Results are also pushed onto a FIFO queue drained with
//! [`Session::fetch`] and friends.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::event::{EventId, EventRouter, Notification, SessionEvent};
use crate::persist::{Row, Storage};
use crate::predicate::{Dialect, quote_ident};
use crate::query::{Limit, Query, Traits};
use crate::record::{ColumnType, IDENTITY, RecordKind, TypeSchema};
use crate::{DocstoreError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Commit,
    Rollback,
    Disconnect,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        *self != TransactionState::Open
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TransactionState::Open => "open",
            TransactionState::Commit => "commit",
            TransactionState::Rollback => "rollback",
            TransactionState::Disconnect => "disconnect",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSample {
    pub event: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
}

impl TimingSample {
    fn new(event: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            event: event.to_string(),
            start,
            end,
            duration_ms: (end - start).num_microseconds().unwrap_or_default() as f64 / 1000.0,
            query: None,
            params: None,
        }
    }
}

type SharedStorage = Arc<Mutex<Box<dyn Storage>>>;
type TypeCell = Arc<OnceCell<Option<Value>>>;

struct SessionInner {
    config: SessionConfig,
    storage: SharedStorage,
    state: Mutex<TransactionState>,
    // a commit, rollback or disconnect is talking to storage
    finishing: AtomicBool,
    queue: Mutex<VecDeque<Value>>,
    timings: Mutex<Vec<TimingSample>>,
    types: Mutex<HashMap<String, TypeCell>>,
    entities: Mutex<HashMap<String, Value>>,
    deadline: Mutex<Instant>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    bus: broadcast::Sender<SessionEvent>,
    router: Arc<EventRouter>,
    started: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("started", &self.inner.started)
            .finish()
    }
}

impl Session {
    // ------------- Lifecycle -------------

    /// Opens the transaction and arms the inactivity watchdog.
    pub async fn start(storage: Box<dyn Storage>, config: SessionConfig) -> Result<Session> {
        let storage: SharedStorage = Arc::new(Mutex::new(storage));
        let notifications = {
            let storage = storage.clone();
            tokio::task::spawn_blocking(move || -> Result<_> {
                let mut storage = storage.lock()?;
                storage.begin()?;
                Ok(storage.notifications())
            })
            .await
            .map_err(|e| DocstoreError::Execution(e.to_string()))??
        };
        let (bus, _) = broadcast::channel(EVENT_CAPACITY);
        let router = Arc::new(EventRouter::new(bus.clone()));
        let inner = Arc::new(SessionInner {
            deadline: Mutex::new(Instant::now() + config.timeout()),
            config,
            storage,
            state: Mutex::new(TransactionState::Open),
            finishing: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            timings: Mutex::new(Vec::new()),
            types: Mutex::new(HashMap::new()),
            entities: Mutex::new(HashMap::new()),
            watchdog: Mutex::new(None),
            dispatcher: Mutex::new(None),
            bus,
            router: router.clone(),
            started: Utc::now(),
        });
        *inner.watchdog.lock()? = Some(tokio::spawn(watchdog(Arc::downgrade(&inner))));
        if let Some(receiver) = notifications {
            *inner.dispatcher.lock()? = Some(tokio::spawn(dispatch(receiver, router)));
        }
        info!(timeout_ms = inner.config.timeout_ms, "session started");
        Ok(Session { inner })
    }

    pub fn state(&self) -> TransactionState {
        self.inner
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(TransactionState::Disconnect)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish(TransactionState::Commit, "commit").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish(TransactionState::Rollback, "rollback").await
    }

    /// Rolls back anything still open and releases the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.finish(TransactionState::Disconnect, "disconnect").await?;
        if let Some(dispatcher) = self.inner.dispatcher.lock()?.take() {
            dispatcher.abort();
        }
        Ok(())
    }

    /// Ends the transaction. The state only turns terminal once storage
    /// agrees; a failed call leaves the session open with the watchdog armed.
    async fn finish(&self, target: TransactionState, operation: &'static str) -> Result<()> {
        {
            let state = self.inner.state.lock()?;
            if state.is_terminal() || self.inner.finishing.swap(true, Ordering::SeqCst) {
                return Err(DocstoreError::State { state: *state, operation });
            }
        }
        let storage = self.inner.storage.clone();
        let start = Utc::now();
        let finished = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut storage = storage.lock()?;
            match target {
                TransactionState::Commit => storage.commit(),
                TransactionState::Rollback => storage.rollback(),
                _ => storage.disconnect(),
            }
        })
        .await
        .map_err(|e| DocstoreError::Execution(e.to_string()))
        .and_then(|finished| finished);
        {
            let mut state = self.inner.state.lock()?;
            self.inner.finishing.store(false, Ordering::SeqCst);
            if let Err(e) = finished {
                warn!(error = %e, operation, "transaction stays open");
                drop(state);
                self.touch()?;
                return Err(e);
            }
            *state = target;
        }
        if let Some(watchdog) = self.inner.watchdog.lock()?.take() {
            watchdog.abort();
        }
        self.record(operation, start, Utc::now(), None)?;
        if target != TransactionState::Disconnect {
            self.inner.release().await;
        }
        self.finish_timings()?;
        info!(state = %target, "session finished");
        Ok(())
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        let state = *self.inner.state.lock()?;
        if state.is_terminal() {
            return Err(DocstoreError::State { state, operation });
        }
        Ok(())
    }

    fn touch(&self) -> Result<()> {
        self.inner.touch()
    }

    // ------------- Execution -------------

    /// The single path every storage call takes.
    async fn run<T, F>(
        &self,
        operation: &'static str,
        sample: Option<(String, Vec<Value>)>,
        work: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Storage) -> Result<T> + Send + 'static,
    {
        self.ensure_open(operation)?;
        let storage = self.inner.storage.clone();
        let start = Utc::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut storage = storage.lock()?;
            work(&mut **storage)
        })
        .await
        .map_err(|e| DocstoreError::Execution(e.to_string()))?;
        self.record(operation, start, Utc::now(), sample)?;
        self.touch()?;
        // the watchdog may have rolled back while the call was in flight
        self.ensure_open(operation)?;
        result
    }

    async fn query(&self, operation: &'static str, sql: String, params: Vec<Value>) -> Result<Vec<Row>> {
        let sample = self.inner.config.timing.then(|| (sql.clone(), params.clone()));
        self.run(operation, sample, move |storage| storage.query(&sql, &params))
            .await
    }

    /// Runs raw SQL; the rows are queued as one array.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let rows = self.query("execute", sql.to_string(), params).await?;
        self.push(Value::Array(rows.iter().cloned().map(Value::Object).collect()))?;
        Ok(rows)
    }

    // ------------- Records -------------

    pub async fn create(&self, kind: RecordKind, record: Value) -> Result<Value> {
        let record = as_object(record)?;
        let row = kind.unresolve(&record);
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut params = Vec::new();
        for (name, value) in &row {
            let Some(column) = kind.columns().into_iter().find(|c| c.name == name) else {
                continue;
            };
            if !kind.writable(name) && name != IDENTITY {
                continue;
            }
            params.push(self.column_param(column.column_type, value));
            columns.push(quote_ident(name));
            values.push(self.placeholder(params.len(), column.column_type));
        }
        let table = quote_ident(kind.table());
        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING *")
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
                columns.join(", "),
                values.join(", ")
            )
        };
        let rows = self.query("create", sql, params).await?;
        let created = self.single_record(kind, rows)?.unwrap_or(Value::Null);
        self.remember(&created)?;
        self.push(created.clone())?;
        Ok(created)
    }

    /// Creates a document of `type_name` with a fresh identity unless `content`
    /// carries one.
    pub async fn create_document(&self, type_name: &str, content: Value) -> Result<Value> {
        let mut record = as_object(content)?;
        record
            .entry(IDENTITY.to_string())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        record.insert("type".to_string(), Value::String(type_name.to_string()));
        self.create(RecordKind::Document, Value::Object(record)).await
    }

    pub async fn create_type(&self, name: &str, schema: Value, meta: Value) -> Result<Value> {
        let mut record = match meta {
            Value::Null => Map::new(),
            other => as_object(other)?,
        };
        record.insert("name".to_string(), Value::String(name.to_string()));
        record.insert("schema".to_string(), schema);
        let created = self.create(RecordKind::Type, Value::Object(record)).await?;
        self.inner.types.lock()?.insert(
            name.to_string(),
            Arc::new(OnceCell::new_with(Some(Some(created.clone())))),
        );
        Ok(created)
    }

    /// The record with identity `id`, or null when there is none.
    pub async fn read(&self, kind: RecordKind, id: &str) -> Result<Option<Value>> {
        let found = self.find(kind, id).await?;
        self.push(found.clone().unwrap_or(Value::Null))?;
        Ok(found)
    }

    async fn find(&self, kind: RecordKind, id: &str) -> Result<Option<Value>> {
        let traits = Traits {
            limit: Limit::Rows(1),
            ..Traits::default()
        };
        let dsl = json!({ "$id": id });
        let records = self.select(kind, &TypeSchema::empty(), &dsl, &traits).await?;
        Ok(records.into_iter().next())
    }

    /// Records of `kind` matching `dsl`. In count mode the result is the bare
    /// count.
    pub async fn search(&self, kind: RecordKind, dsl: &Value, traits: &Traits) -> Result<Value> {
        let schema = match type_filter(dsl) {
            Some(type_name) if kind == RecordKind::Document => self.type_schema(&type_name).await?,
            _ => TypeSchema::empty(),
        };
        let records = self.select(kind, &schema, dsl, traits).await?;
        let result = outcome(records, traits.count);
        self.push(result.clone())?;
        Ok(result)
    }

    /// Documents of `type_name` matching `dsl`, with payload keys cast by the
    /// type's schema.
    pub async fn search_documents(&self, type_name: &str, dsl: &Value, traits: &Traits) -> Result<Value> {
        let schema = self.type_schema(type_name).await?;
        let typed = json!({ "$type": type_name });
        let dsl = match dsl {
            Value::Null => typed,
            other => json!([typed, other]),
        };
        let records = self.select(RecordKind::Document, &schema, &dsl, traits).await?;
        let result = outcome(records, traits.count);
        self.push(result.clone())?;
        Ok(result)
    }

    pub async fn count(&self, kind: RecordKind, dsl: &Value) -> Result<u64> {
        let count = self.search(kind, dsl, &Traits::counting()).await?;
        Ok(count.as_u64().unwrap_or_default())
    }

    async fn select(&self, kind: RecordKind, schema: &TypeSchema, dsl: &Value, traits: &Traits) -> Result<Vec<Value>> {
        let compiled = Query::from_traits(kind, schema, self.dialect(), dsl, traits)?.compile()?;
        let rows = self
            .query("search", compiled.sql.clone(), compiled.params.clone())
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = compiled.decode(row)?;
            if !compiled.count {
                self.remember(&record)?;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Writes only the columns whose serialized value changed. Without changes
    /// the current record is queued as is.
    pub async fn update(&self, kind: RecordKind, record: Value) -> Result<Value> {
        let changes = as_object(record)?;
        let id = changes
            .get(IDENTITY)
            .and_then(Value::as_str)
            .ok_or_else(|| DocstoreError::compile("update needs a string 'id'"))?
            .to_string();
        let current = self
            .find(kind, &id)
            .await?
            .ok_or_else(|| DocstoreError::NotFound(format!("{kind} {id}")))?;
        let current = as_object(current)?;
        let mut next = current.clone();
        for (key, value) in changes {
            next.insert(key, value);
        }
        let before = kind.unresolve(&current);
        let after = kind.unresolve(&next);

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for column in kind.columns() {
            if !kind.writable(column.name) {
                continue;
            }
            let old = before.get(column.name).map(Value::to_string);
            let new = after.get(column.name).map(Value::to_string);
            if old == new {
                continue;
            }
            let value = after.get(column.name).cloned().unwrap_or(Value::Null);
            params.push(self.column_param(column.column_type, &value));
            assignments.push(format!(
                "{} = {}",
                quote_ident(column.name),
                self.placeholder(params.len(), column.column_type)
            ));
        }
        if assignments.is_empty() {
            debug!(%kind, id = %id, "update without changes");
            let current = Value::Object(kind.resolve(before));
            self.push(current.clone())?;
            return Ok(current);
        }
        params.push(Value::String(id));
        let sql = format!(
            "UPDATE {} SET {} WHERE \"id\" = ${} RETURNING *",
            quote_ident(kind.table()),
            assignments.join(", "),
            params.len()
        );
        let rows = self.query("update", sql, params).await?;
        let updated = self.single_record(kind, rows)?.unwrap_or(Value::Null);
        self.remember(&updated)?;
        self.push(updated.clone())?;
        Ok(updated)
    }

    /// Deletes by identity; queues whether a row was removed.
    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE \"id\" = $1 RETURNING \"id\"", quote_ident(kind.table()));
        let rows = self
            .query("delete", sql, vec![Value::String(id.to_string())])
            .await?;
        let removed = !rows.is_empty();
        self.inner.entities.lock()?.remove(id);
        self.push(Value::Bool(removed))?;
        Ok(removed)
    }

    fn dialect(&self) -> Dialect {
        self.inner.config.dialect
    }

    fn placeholder(&self, n: usize, column_type: ColumnType) -> String {
        match (self.dialect(), column_type) {
            (Dialect::Postgres, ColumnType::Json) => format!("${n}::jsonb"),
            (Dialect::Postgres, ColumnType::Timestamp) => format!("${n}::timestamptz"),
            _ => format!("${n}"),
        }
    }

    fn column_param(&self, column_type: ColumnType, value: &Value) -> Value {
        match column_type {
            ColumnType::Json => Value::String(value.to_string()),
            _ => value.clone(),
        }
    }

    fn single_record(&self, kind: RecordKind, rows: Vec<Row>) -> Result<Option<Value>> {
        match rows.into_iter().next() {
            Some(row) => Ok(Some(Value::Object(kind.resolve(kind.decode_row(row)?)))),
            None => Ok(None),
        }
    }

    // ------------- Caches -------------

    /// The Type record named `name`, looked up once per session.
    pub async fn get_type(&self, name: &str) -> Result<Option<Value>> {
        let found = self.lookup_type(name).await?;
        self.push(found.clone().unwrap_or(Value::Null))?;
        Ok(found)
    }

    async fn lookup_type(&self, name: &str) -> Result<Option<Value>> {
        let cell = {
            let mut types = self.inner.types.lock()?;
            types.entry(name.to_string()).or_default().clone()
        };
        let found = cell
            .get_or_try_init(|| async {
                let traits = Traits {
                    limit: Limit::Rows(1),
                    ..Traits::default()
                };
                let dsl = json!({ "$name": name });
                let records = self
                    .select(RecordKind::Type, &TypeSchema::empty(), &dsl, &traits)
                    .await?;
                Ok::<_, DocstoreError>(records.into_iter().next())
            })
            .await?;
        Ok(found.clone())
    }

    async fn type_schema(&self, name: &str) -> Result<TypeSchema> {
        Ok(self
            .lookup_type(name)
            .await?
            .and_then(|record| record.get("schema").cloned())
            .map(TypeSchema::new)
            .unwrap_or_else(TypeSchema::empty))
    }

    /// The last version of an entity this session has seen.
    pub fn cached(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.inner.entities.lock()?.get(id).cloned())
    }

    fn remember(&self, record: &Value) -> Result<()> {
        if let Some(id) = record.get(IDENTITY).and_then(Value::as_str) {
            self.inner
                .entities
                .lock()?
                .insert(id.to_string(), record.clone());
        }
        Ok(())
    }

    // ------------- Events -------------

    /// A receiver for timeout and change events raised from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.bus.subscribe()
    }

    pub async fn subscribe(&self, identifier: &str) -> Result<EventId> {
        let router = self.inner.router.clone();
        let identifier = identifier.to_string();
        self.run("subscribe", None, move |storage| {
            let (event, channel) = router.subscribe(&identifier)?;
            if let Some(channel) = channel {
                if let Err(e) = storage.listen(&channel) {
                    router.unsubscribe(&identifier)?;
                    return Err(e);
                }
                debug!(%channel, "listening");
            }
            Ok(event)
        })
        .await
    }

    pub async fn unsubscribe(&self, identifier: &str) -> Result<EventId> {
        let router = self.inner.router.clone();
        let identifier = identifier.to_string();
        self.run("unsubscribe", None, move |storage| {
            let (event, channel) = router.unsubscribe(&identifier)?;
            if let Some(channel) = channel {
                storage.unlisten(&channel)?;
                debug!(%channel, "stopped listening");
            }
            Ok(event)
        })
        .await
    }

    /// How many subscriptions share the normalized form of `identifier`.
    pub fn subscriptions(&self, identifier: &str) -> Result<usize> {
        self.inner.router.listener_count(identifier)
    }

    // ------------- Queue -------------

    fn push(&self, value: Value) -> Result<()> {
        self.inner.queue.lock()?.push_back(value);
        Ok(())
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.inner.queue.lock()?.len())
    }

    /// Pops the oldest queued result.
    pub fn fetch(&self) -> Result<Option<Value>> {
        Ok(self.inner.queue.lock()?.pop_front())
    }

    /// Pops the oldest result, which must hold at most one record. A result
    /// holding more stays queued.
    pub fn fetch_single(&self) -> Result<Option<Value>> {
        let mut queue = self.inner.queue.lock()?;
        if let Some(Value::Array(items)) = queue.front() {
            if items.len() > 1 {
                return Err(DocstoreError::Execution(format!(
                    "expected at most one result, got {}",
                    items.len()
                )));
            }
        }
        match queue.pop_front() {
            Some(Value::Array(mut items)) => Ok(items.pop()),
            Some(Value::Null) | None => Ok(None),
            other => Ok(other),
        }
    }

    /// Pops the oldest result and keeps its first record.
    pub fn fetch_first(&self) -> Result<Option<Value>> {
        match self.fetch()? {
            Some(Value::Array(items)) => {
                if items.len() > 1 {
                    warn!(discarded = items.len() - 1, "fetch_first dropped extra results");
                }
                Ok(items.into_iter().next())
            }
            Some(Value::Null) | None => Ok(None),
            other => Ok(other),
        }
    }

    // ------------- Timing -------------

    fn record(
        &self,
        event: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample: Option<(String, Vec<Value>)>,
    ) -> Result<()> {
        if !self.inner.config.timing {
            return Ok(());
        }
        let mut timing = TimingSample::new(event, start, end);
        if let Some((query, params)) = sample {
            timing.query = Some(query);
            timing.params = Some(params);
        }
        self.inner.timings.lock()?.push(timing);
        Ok(())
    }

    fn finish_timings(&self) -> Result<()> {
        if !self.inner.config.timing {
            return Ok(());
        }
        let mut timings = self.inner.timings.lock()?;
        let end = Utc::now();
        let server: f64 = timings
            .iter()
            .filter(|t| t.query.is_some())
            .map(|t| t.duration_ms)
            .sum();
        timings.push(TimingSample::new("transaction", self.inner.started, end));
        let mut total = TimingSample::new("transaction:server", self.inner.started, end);
        total.duration_ms = server;
        timings.push(total);
        Ok(())
    }

    pub fn timings(&self) -> Result<Vec<TimingSample>> {
        Ok(self.inner.timings.lock()?.clone())
    }
}

enum Expiry {
    RolledBack,
    // a commit, rollback or disconnect is in flight
    Busy,
    Closed,
}

impl SessionInner {
    fn touch(&self) -> Result<()> {
        *self.deadline.lock()? = Instant::now() + self.config.timeout();
        Ok(())
    }

    /// Rolls back an inactive transaction. Only the first terminal
    /// transition wins, so this runs at most once.
    async fn expire(&self) -> Expiry {
        {
            let Ok(mut state) = self.state.lock() else {
                return Expiry::Closed;
            };
            if state.is_terminal() {
                return Expiry::Closed;
            }
            if self.finishing.load(Ordering::SeqCst) {
                return Expiry::Busy;
            }
            *state = TransactionState::Rollback;
        }
        warn!(timeout_ms = self.config.timeout_ms, "transaction timed out, rolling back");
        // a send only fails when nobody is listening
        let _ = self.bus.send(SessionEvent::Timeout);
        let storage = self.storage.clone();
        let rolled_back = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut storage = storage.lock()?;
            storage.rollback()
        })
        .await;
        match rolled_back {
            Ok(Ok(())) => info!("session rolled back after timeout"),
            Ok(Err(e)) => error!(error = %e, "rollback after timeout failed"),
            Err(e) => error!(error = %e, "rollback after timeout panicked"),
        }
        self.release().await;
        Expiry::RolledBack
    }

    /// Hands the connection back once the transaction is over.
    async fn release(&self) {
        let storage = self.storage.clone();
        let released = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut storage = storage.lock()?;
            storage.disconnect()
        })
        .await;
        match released {
            Ok(Ok(())) => debug!("connection released"),
            Ok(Err(e)) => warn!(error = %e, "releasing the connection failed"),
            Err(e) => warn!(error = %e, "releasing the connection panicked"),
        }
    }
}

async fn watchdog(session: Weak<SessionInner>) {
    loop {
        let Some(deadline) = session.upgrade().and_then(|s| s.deadline.lock().ok().map(|d| *d)) else {
            return;
        };
        tokio::time::sleep_until(deadline).await;
        let Some(inner) = session.upgrade() else {
            return;
        };
        let current = match inner.deadline.lock() {
            Ok(deadline) => *deadline,
            Err(_) => return,
        };
        if Instant::now() < current {
            continue;
        }
        match inner.expire().await {
            Expiry::Busy => {
                // look again one timeout later; a failed commit leaves us armed
                if inner.touch().is_err() {
                    return;
                }
            }
            Expiry::RolledBack | Expiry::Closed => return,
        }
    }
}

async fn dispatch(mut receiver: mpsc::UnboundedReceiver<Notification>, router: Arc<EventRouter>) {
    while let Some(notification) = receiver.recv().await {
        match router.dispatch(&notification) {
            Ok(emitted) => debug!(channel = %notification.channel, emitted, "notification routed"),
            Err(e) => warn!(error = %e, payload = %notification.payload, "notification dropped"),
        }
    }
}

fn outcome(records: Vec<Value>, count: bool) -> Value {
    if count {
        records.into_iter().next().unwrap_or(Value::from(0))
    } else {
        Value::Array(records)
    }
}

fn as_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DocstoreError::Json(format!("expected an object, got {other}"))),
    }
}

/// The `$type` a document search is restricted to, if any.
fn type_filter(dsl: &Value) -> Option<String> {
    let direct = |v: &Value| v.get("$type").and_then(Value::as_str).map(str::to_string);
    match dsl {
        Value::Object(_) => direct(dsl),
        Value::Array(items) => items.iter().find_map(direct),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_filter_looks_one_level_deep() {
        assert_eq!(type_filter(&json!({"$type": "User"})), Some("User".to_string()));
        assert_eq!(type_filter(&json!(["OR", {"$type": "A"}, {"x": 1}])), Some("A".to_string()));
        assert_eq!(type_filter(&json!({"name": "x"})), None);
    }

    #[test]
    fn states_render_lowercase() {
        assert_eq!(TransactionState::Rollback.to_string(), "rollback");
        assert!(TransactionState::Commit.is_terminal());
        assert!(!TransactionState::Open.is_terminal());
    }
}
