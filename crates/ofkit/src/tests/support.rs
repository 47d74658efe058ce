use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    controller::ControllerHandle,
    error::ControllerError,
    event::Event,
    transport::{Transport, TransportLink},
    Configuration,
};

pub(crate) type EventSink = mpsc::UnboundedSender<Event>;
pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn record(log: &EventLog, entry: impl Into<String>) {
    log.lock().expect("log lock").push(entry.into());
}

pub(crate) fn contents(log: &EventLog) -> Vec<String> {
    log.lock().expect("log lock").clone()
}

/// One listen endpoint so the scripted engine sees a single LISTEN.
pub(crate) fn test_config() -> Configuration {
    Configuration {
        listen_endpoints: vec!["6653".to_string()],
        ..Configuration::default()
    }
}

/// Schedules a graceful exit after `delay`, from the current phase scope.
pub(crate) fn schedule_exit(controller: &ControllerHandle, delay: Duration) {
    let handle = controller.clone();
    controller.create_task(async move {
        tokio::time::sleep(delay).await;
        handle.shutdown();
        Ok(())
    });
}

/// Scripted in-process stand-in for the protocol engine: every frame the
/// controller writes is handed to the behavior closure, which may push
/// events back.
pub(crate) struct MockTransport {
    behavior: Option<Box<dyn FnMut(&Value, &EventSink) + Send>>,
    task: Option<JoinHandle<()>>,
}

impl MockTransport {
    pub(crate) fn new(behavior: impl FnMut(&Value, &EventSink) + Send + 'static) -> Self {
        Self {
            behavior: Some(Box::new(behavior)),
            task: None,
        }
    }

    /// The common session: description and listen succeed, then one switch
    /// connects and disconnects.
    pub(crate) fn switch_session() -> Self {
        Self::new(|frame, events| {
            respond_openflow(frame, events, true);
        })
    }

    /// Like [`MockTransport::switch_session`] but the switch stays
    /// connected.
    pub(crate) fn switch_stays_up() -> Self {
        Self::new(|frame, events| {
            respond_openflow(frame, events, false);
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<TransportLink, ControllerError> {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Value>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut behavior = self.behavior.take().expect("transport opened twice");
        self.task = Some(tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                behavior(&frame, &event_tx);
            }
        }));
        Ok(TransportLink {
            events: event_rx,
            writer: writer_tx,
        })
    }

    async fn close(&mut self) -> Result<(), ControllerError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Answers the start-sequence RPCs; returns true when the frame was
/// consumed.
pub(crate) fn respond_openflow(frame: &Value, events: &EventSink, include_down: bool) -> bool {
    match frame.get("method").and_then(Value::as_str) {
        Some("OFP.DESCRIPTION") => {
            reply_to(
                frame,
                events,
                json!({
                    "major_version": 1,
                    "minor_version": 0,
                    "software_version": "mock-0.1",
                    "ofp_versions": [4],
                }),
            );
            true
        }
        Some("OFP.LISTEN") => {
            reply_to(frame, events, json!({"conn_id": 1}));
            push(events, channel_up(2, "00:00:00:00:00:00:00:01"));
            if include_down {
                push(events, channel_down(2));
            }
            true
        }
        _ => false,
    }
}

pub(crate) fn reply_to(frame: &Value, events: &EventSink, result: Value) {
    let id = frame.get("id").cloned().unwrap_or(Value::Null);
    push(events, json!({"id": id, "result": result}));
}

pub(crate) fn error_to(frame: &Value, events: &EventSink, message: &str) {
    let id = frame.get("id").cloned().unwrap_or(Value::Null);
    push(events, json!({"id": id, "error": {"code": -32000, "message": message}}));
}

pub(crate) fn push(events: &EventSink, value: Value) {
    let event = Event::from_value(value).expect("event object");
    let _ = events.send(event);
}

pub(crate) fn channel_up(conn_id: u64, datapath_id: &str) -> Value {
    json!({
        "type": "CHANNEL_UP",
        "conn_id": conn_id,
        "datapath_id": datapath_id,
        "version": 4,
    })
}

pub(crate) fn channel_down(conn_id: u64) -> Value {
    json!({"type": "CHANNEL_DOWN", "conn_id": conn_id})
}
