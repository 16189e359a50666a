#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docstore::{DocstoreError, Result};
use docstore::event::Notification;
use docstore::persist::{Row, Storage};
use serde_json::Value;
use tokio::sync::mpsc;

/// A storage that records every call and answers queries with canned rows.
pub struct RecordingStorage {
    recorder: Recorder,
    receiver: Option<mpsc::UnboundedReceiver<Notification>>,
}

#[derive(Clone)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub params: Arc<Mutex<Vec<Vec<Value>>>>,
    pub rows: Arc<Mutex<VecDeque<Vec<Row>>>>,
    pub listening: Arc<Mutex<HashSet<String>>>,
    pub delay: Arc<Mutex<Duration>>,
    pub busy: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Notification>,
}

impl Recorder {
    pub fn answer(&self, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                Value::Object(map) => map,
                other => panic!("canned row {other} is not an object"),
            })
            .collect();
        self.rows.lock().unwrap().push_back(rows);
    }
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
    pub fn queries(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c.as_str(), "begin" | "commit" | "rollback" | "disconnect"))
            .filter(|c| !c.starts_with("listen ") && !c.starts_with("unlisten "))
            .collect()
    }
    pub fn last_params(&self) -> Vec<Value> {
        self.params.lock().unwrap().last().cloned().unwrap_or_default()
    }
    pub fn is_listening(&self, channel: &str) -> bool {
        self.listening.lock().unwrap().contains(channel)
    }
    pub fn notify(&self, channel: &str, payload: &str) {
        self.sender.send(Notification::new(channel, payload)).unwrap();
    }
    pub fn slow_queries(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
    /// Makes every commit fail until switched off again.
    pub fn refuse_commits(&self, refuse: bool) {
        self.busy.store(refuse, Ordering::SeqCst);
    }
}

pub fn setup() -> (Box<dyn Storage>, Recorder) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let recorder = Recorder {
        calls: Arc::new(Mutex::new(Vec::new())),
        params: Arc::new(Mutex::new(Vec::new())),
        rows: Arc::new(Mutex::new(VecDeque::new())),
        listening: Arc::new(Mutex::new(HashSet::new())),
        delay: Arc::new(Mutex::new(Duration::ZERO)),
        busy: Arc::new(AtomicBool::new(false)),
        sender,
    };
    let storage = RecordingStorage {
        recorder: recorder.clone(),
        receiver: Some(receiver),
    };
    (Box::new(storage), recorder)
}

impl RecordingStorage {
    fn log(&self, call: &str) {
        self.recorder.calls.lock().unwrap().push(call.to_string());
    }
}

impl Storage for RecordingStorage {
    fn begin(&mut self) -> Result<()> {
        self.log("begin");
        Ok(())
    }
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.log(sql);
        self.recorder.params.lock().unwrap().push(params.to_vec());
        let delay = *self.recorder.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(self.recorder.rows.lock().unwrap().pop_front().unwrap_or_default())
    }
    fn commit(&mut self) -> Result<()> {
        self.log("commit");
        if self.recorder.busy.load(Ordering::SeqCst) {
            return Err(DocstoreError::Execution("busy".to_string()));
        }
        Ok(())
    }
    fn rollback(&mut self) -> Result<()> {
        self.log("rollback");
        Ok(())
    }
    fn disconnect(&mut self) -> Result<()> {
        self.log("disconnect");
        Ok(())
    }
    fn listen(&mut self, channel: &str) -> Result<()> {
        self.log(&format!("listen {channel}"));
        self.recorder.listening.lock().unwrap().insert(channel.to_string());
        Ok(())
    }
    fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.log(&format!("unlisten {channel}"));
        self.recorder.listening.lock().unwrap().remove(channel);
        Ok(())
    }
    fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.receiver.take()
    }
}
