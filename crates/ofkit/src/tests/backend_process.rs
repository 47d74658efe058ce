use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};

use async_trait::async_trait;

use crate::{
    app::{App, HandlerResult},
    config::{BackendConfig, Configuration},
    controller::{Controller, ControllerHandle},
    datapath::Datapath,
    error::EXIT_STATUS_OK,
    event::Event,
    transport::SubprocessTransport,
};

use super::support::{contents, new_log, record, schedule_exit, EventLog};

/// Minimal stand-in for the protocol engine: answers the start-sequence
/// RPCs on stdin and simulates one switch session.
fn write_fake_engine() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-engine");
    let script = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "OFP.DESCRIPTION":
        send({"id": msg["id"], "result": {"major_version": 1, "minor_version": 0, "software_version": "fake-0.1", "ofp_versions": [4]}})
    elif method == "OFP.LISTEN":
        send({"id": msg["id"], "result": {"conn_id": 1}})
        send({"type": "CHANNEL_UP", "conn_id": 2, "datapath_id": "00:00:00:00:00:00:00:01", "version": 4})
        send({"type": "CHANNEL_DOWN", "conn_id": 2})
"#;
    fs::write(&script_path, script).expect("write script");
    let mut permissions = fs::metadata(&script_path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&script_path, permissions).expect("chmod");
    (dir, script_path)
}

struct Recorder {
    log: EventLog,
}

#[async_trait]
impl App for Recorder {
    async fn on_start(&mut self, controller: &ControllerHandle) -> HandlerResult {
        record(&self.log, "START");
        schedule_exit(controller, Duration::from_millis(50));
        Ok(())
    }

    async fn on_stop(&mut self, _controller: &ControllerHandle) -> HandlerResult {
        record(&self.log, "STOP");
        Ok(())
    }

    fn on_channel_up(
        &mut self,
        _controller: &ControllerHandle,
        dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        record(&self.log, format!("CHANNEL_UP {}", dp.id()));
        Ok(())
    }

    fn on_channel_down(
        &mut self,
        _controller: &ControllerHandle,
        _dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        record(&self.log, "CHANNEL_DOWN");
        Ok(())
    }
}

#[tokio::test]
async fn subprocess_engine_drives_a_full_session() {
    let (_dir, script_path) = write_fake_engine();
    let backend = BackendConfig {
        binary: script_path,
        args: Vec::new(),
        prefix: Vec::new(),
    };
    let config = Configuration {
        listen_endpoints: vec!["6653".to_string()],
        backend: backend.clone(),
        ..Configuration::default()
    };

    let log = new_log();
    let status = Controller::builder()
        .config(config)
        .app(Recorder { log: log.clone() })
        .transport(SubprocessTransport::new(backend))
        .build()
        .run()
        .await;

    assert_eq!(status, EXIT_STATUS_OK);
    assert_eq!(
        contents(&log),
        [
            "START",
            "CHANNEL_UP 00:00:00:00:00:00:00:01",
            "CHANNEL_DOWN",
            "STOP"
        ]
    );
}
