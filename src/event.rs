//! Change events.
//!
//! Event identifiers follow `[Type#][id@][eventName]`. Subscriptions are
//! counted per normalized identifier; the first one for a channel asks the
//! caller to LISTEN on it, the last one leaving asks it to UNLISTEN.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use bimap::BiMap;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::record::RecordKind;
use crate::{DocstoreError, Result};

pub const DEFAULT_CHANNEL: &str = "tcn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    pub fn code(&self) -> char {
        match self {
            Op::Insert => 'I',
            Op::Update => 'U',
            Op::Delete => 'D',
        }
    }
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Op::Insert),
            "U" => Some(Op::Update),
            "D" => Some(Op::Delete),
            _ => None,
        }
    }
}

const NOTIFYING: [RecordKind; 6] = [
    RecordKind::Document,
    RecordKind::Type,
    RecordKind::Attachment,
    RecordKind::Lib,
    RecordKind::Method,
    RecordKind::View,
];

lazy_static! {
    static ref EVENT_NAMES: BiMap<(String, Op), String> = {
        let mut names = BiMap::new();
        for kind in NOTIFYING {
            for (op, suffix) in [(Op::Insert, "Created"), (Op::Update, "Modified"), (Op::Delete, "Removed")] {
                names.insert((kind.table().to_string(), op), format!("{}{}", kind.table(), suffix));
            }
        }
        names
    };
    static ref PAYLOAD: Regex =
        Regex::new(r#"^"([^"]+)",([IUD]),"([^"]+)"='((?:[^']|'')*)'$"#).unwrap();
    static ref UUID: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
    static ref NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref IDENT: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Domain event name for a row change, e.g. `("document", Insert)` is
/// `documentCreated`.
pub fn event_name(table: &str, op: Op) -> Option<&'static str> {
    EVENT_NAMES
        .get_by_left(&(table.to_string(), op))
        .map(String::as_str)
}

/// The table and operation behind an event name.
pub fn event_source(name: &str) -> Option<(&'static str, Op)> {
    EVENT_NAMES
        .get_by_right(name)
        .map(|(table, op)| (table.as_str(), *op))
}

pub fn is_identity(token: &str) -> bool {
    UUID.is_match(token)
}

// ------------- Event identifiers -------------
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EventId {
    pub type_name: Option<String>,
    pub id: Option<String>,
    pub event: Option<String>,
}

impl EventId {
    /// Parses `[Type#][id@][event]`.
    ///
    /// A bare token without `@` is read as an identity when it is UUID shaped.
    /// Otherwise it names an event when it follows `Type#` or is a known
    /// event name such as `documentCreated`, and a type in every other case.
    /// Event names are accepted here so that `User#documentCreated` and
    /// `documentCreated` subscribe to that event instead of to a type
    /// literally called `documentCreated`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (type_name, rest) = match text.split_once('#') {
            Some((type_name, rest)) => (non_empty(type_name), rest),
            None => (None, text),
        };
        let mut parsed = match rest.split_once('@') {
            Some((id, event)) => EventId {
                type_name,
                id: non_empty(id),
                event: non_empty(event),
            },
            None => {
                let mut parsed = EventId {
                    type_name,
                    ..Default::default()
                };
                if let Some(token) = non_empty(rest) {
                    // a bare token is an identity, then an event, then a type
                    if is_identity(&token) {
                        parsed.id = Some(token);
                    } else if parsed.type_name.is_some() || event_source(&token).is_some() {
                        parsed.event = Some(token);
                    } else {
                        parsed.type_name = Some(token);
                    }
                }
                parsed
            }
        };
        parsed.validate()?;
        if let Some(id) = parsed.id.as_mut() {
            if is_identity(id) {
                *id = id.to_lowercase();
            }
        }
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if let Some(type_name) = &self.type_name {
            if !NAME.is_match(type_name) {
                return Err(DocstoreError::Event(format!("bad type name '{type_name}'")));
            }
        }
        if let Some(id) = &self.id {
            if !IDENT.is_match(id) {
                return Err(DocstoreError::Event(format!("bad identity '{id}'")));
            }
        }
        if let Some(event) = &self.event {
            if !NAME.is_match(event) {
                return Err(DocstoreError::Event(format!("bad event name '{event}'")));
            }
        }
        Ok(())
    }

    pub fn with_type(mut self, type_name: &str) -> Self {
        self.type_name = Some(type_name.to_string());
        self
    }
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }
    pub fn with_event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    /// `tcn` plus the lowercased type name, or the default channel.
    pub fn channel(&self) -> String {
        match &self.type_name {
            Some(type_name) => format!("{DEFAULT_CHANNEL}{}", type_name.to_lowercase()),
            None => DEFAULT_CHANNEL.to_string(),
        }
    }

    /// Whether a change on `id` named `event` passes this identifier's filter.
    pub fn accepts(&self, id: &str, event: &str) -> bool {
        self.id.as_deref().is_none_or(|wanted| wanted.eq_ignore_ascii_case(id))
            && self.event.as_deref().is_none_or(|wanted| wanted == event)
    }
}

fn non_empty(token: &str) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(type_name) = &self.type_name {
            write!(f, "{type_name}#")?;
        }
        if let Some(id) = &self.id {
            write!(f, "{id}@")?;
        }
        if let Some(event) = &self.event {
            write!(f, "{event}")?;
        }
        Ok(())
    }
}

impl FromStr for EventId {
    type Err = DocstoreError;
    fn from_str(s: &str) -> Result<Self> {
        EventId::parse(s)
    }
}

// ------------- Notifications -------------
/// A raw payload as delivered on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// `"table",OP,"column"='value'`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub table: String,
    pub op: Op,
    pub column: String,
    pub value: String,
}

impl RowChange {
    pub fn parse(payload: &str) -> Result<Self> {
        let captures = PAYLOAD
            .captures(payload.trim())
            .ok_or_else(|| DocstoreError::Event(format!("unrecognized payload {payload}")))?;
        let op = Op::from_code(&captures[2])
            .ok_or_else(|| DocstoreError::Event(format!("unknown operation {}", &captures[2])))?;
        Ok(Self {
            table: captures[1].to_string(),
            op,
            column: captures[3].to_string(),
            value: captures[4].replace("''", "'"),
        })
    }
    pub fn to_payload(&self) -> String {
        format!(
            "\"{}\",{},\"{}\"='{}'",
            self.table,
            self.op.code(),
            self.column,
            self.value.replace('\'', "''")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// The normalized identifier the receiving subscription was made with.
    pub subscription: EventId,
    pub event: EventId,
    pub table: String,
    pub op: Op,
}

/// Everything a session publishes on its local bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Timeout,
    Change(ChangeEvent),
}

// ------------- Router -------------
#[derive(Debug)]
struct Listener {
    filter: EventId,
    channel: String,
    count: usize,
}

#[derive(Debug, Default)]
struct RouterState {
    listeners: HashMap<String, Listener>,
    channels: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct EventRouter {
    state: Mutex<RouterState>,
    bus: broadcast::Sender<SessionEvent>,
}

impl EventRouter {
    pub fn new(bus: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            bus,
        }
    }

    /// Registers one subscription. Returns the normalized identifier and the
    /// channel to LISTEN on when this is the first listener using it.
    pub fn subscribe(&self, identifier: &str) -> Result<(EventId, Option<String>)> {
        let filter = EventId::parse(identifier)?;
        let key = filter.to_string();
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        if let Some(listener) = state.listeners.get_mut(&key) {
            listener.count += 1;
            trace!(event = %key, count = listener.count, "subscription added");
            return Ok((filter, None));
        }
        let channel = filter.channel();
        state.listeners.insert(
            key.clone(),
            Listener {
                filter: filter.clone(),
                channel: channel.clone(),
                count: 1,
            },
        );
        let users = state.channels.entry(channel.clone()).or_insert(0);
        *users += 1;
        let open = (*users == 1).then_some(channel);
        debug!(event = %key, "listener installed");
        Ok((filter, open))
    }

    /// Drops one subscription. Returns the channel to UNLISTEN when nothing
    /// listens on it anymore. Unknown identifiers are ignored.
    pub fn unsubscribe(&self, identifier: &str) -> Result<(EventId, Option<String>)> {
        let filter = EventId::parse(identifier)?;
        let key = filter.to_string();
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let Some(listener) = state.listeners.get_mut(&key) else {
            return Ok((filter, None));
        };
        listener.count -= 1;
        if listener.count > 0 {
            return Ok((filter, None));
        }
        let channel = listener.channel.clone();
        state.listeners.remove(&key);
        debug!(event = %key, "listener removed");
        let close = match state.channels.get_mut(&channel) {
            Some(users) if *users > 1 => {
                *users -= 1;
                None
            }
            Some(_) => {
                state.channels.remove(&channel);
                Some(channel)
            }
            None => None,
        };
        Ok((filter, close))
    }

    pub fn listener_count(&self, identifier: &str) -> Result<usize> {
        let key = EventId::parse(identifier)?.to_string();
        Ok(self.state.lock()?.listeners.get(&key).map_or(0, |l| l.count))
    }

    pub fn is_listening(&self, channel: &str) -> Result<bool> {
        Ok(self.state.lock()?.channels.contains_key(channel))
    }

    pub fn channels(&self) -> Result<Vec<String>> {
        let mut channels: Vec<String> = self.state.lock()?.channels.keys().cloned().collect();
        channels.sort();
        Ok(channels)
    }

    /// Maps a notification to domain events and re-emits it to every matching
    /// listener. Returns how many events were emitted.
    pub fn dispatch(&self, notification: &Notification) -> Result<usize> {
        let change = RowChange::parse(&notification.payload)?;
        let Some(name) = event_name(&change.table, change.op) else {
            debug!(table = %change.table, "no event for table");
            return Ok(0);
        };
        let state = self.state.lock()?;
        let mut emitted = 0;
        for (key, listener) in &state.listeners {
            if listener.channel != notification.channel || !listener.filter.accepts(&change.value, name) {
                continue;
            }
            let event = EventId {
                type_name: listener.filter.type_name.clone(),
                id: Some(change.value.clone()),
                event: Some(name.to_string()),
            };
            trace!(subscription = %key, event = %event, "dispatching");
            // a send only fails when nobody holds a receiver
            let _ = self.bus.send(SessionEvent::Change(ChangeEvent {
                subscription: listener.filter.clone(),
                event,
                table: change.table.clone(),
                op: change.op,
            }));
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_table_is_bidirectional() {
        assert_eq!(event_name("document", Op::Insert), Some("documentCreated"));
        assert_eq!(event_name("view", Op::Delete), Some("viewRemoved"));
        assert_eq!(event_source("typeModified"), Some(("type", Op::Update)));
        assert_eq!(event_name("dbversion", Op::Insert), None);
    }

    #[test]
    fn payload_quotes_are_unescaped() {
        let change = RowChange::parse(r#""document",U,"id"='it''s'"#).unwrap();
        assert_eq!(change.value, "it's");
        assert_eq!(change.op, Op::Update);
        assert_eq!(change.to_payload(), r#""document",U,"id"='it''s'"#);
    }
}
