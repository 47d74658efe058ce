use std::{ffi::OsString, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{config::BackendConfig, error::ControllerError, event::Event};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_RETRIES: u32 = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Channel pair connecting the controller to a protocol engine: incoming
/// events and an outgoing frame writer.
pub struct TransportLink {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub writer: mpsc::UnboundedSender<Value>,
}

/// Bidirectional JSON-line stream to an OpenFlow protocol engine.
///
/// The engine is opaque to the controller: it produces a stream of event
/// records and consumes request frames. Closing the incoming stream signals
/// end of input and drives the controller toward exit.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<TransportLink, ControllerError>;
    async fn close(&mut self) -> Result<(), ControllerError>;
}

/// Transport that runs the protocol engine as a subprocess speaking
/// line-delimited JSON over stdio.
pub struct SubprocessTransport {
    config: BackendConfig,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl SubprocessTransport {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            child: None,
            tasks: Vec::new(),
        }
    }

    fn command(&self) -> Command {
        let mut argv: Vec<OsString> = self
            .config
            .prefix
            .iter()
            .map(OsString::from)
            .collect();
        argv.push(self.config.binary.as_os_str().to_os_string());
        argv.extend(self.config.args.iter().map(OsString::from));

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn open(&mut self) -> Result<TransportLink, ControllerError> {
        let mut command = self.command();

        // A freshly installed engine binary can still be open for writing;
        // text-file-busy is transient, so retry briefly.
        let mut retries = SPAWN_RETRIES;
        let mut child = loop {
            match command.spawn() {
                Ok(child) => break child,
                Err(source)
                    if source.kind() == std::io::ErrorKind::ExecutableFileBusy && retries > 0 =>
                {
                    retries -= 1;
                    time::sleep(SPAWN_RETRY_DELAY).await;
                }
                Err(source) => {
                    return Err(ControllerError::Spawn {
                        binary: self.config.binary.clone(),
                        source,
                    });
                }
            }
        };

        let stdin = child.stdin.take().ok_or(ControllerError::StdinUnavailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ControllerError::StdoutUnavailable)?;
        let stderr = child.stderr.take();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.tasks.push(tokio::spawn(writer_task(stdin, writer_rx)));
        self.tasks.push(tokio::spawn(reader_task(stdout, event_tx)));
        if let Some(stderr) = stderr {
            self.tasks.push(tokio::spawn(stderr_task(stderr)));
        }

        debug!(pid = child.id(), binary = ?self.config.binary, "protocol engine started");
        self.child = Some(child);
        Ok(TransportLink {
            events: event_rx,
            writer: writer_tx,
        })
    }

    async fn close(&mut self) -> Result<(), ControllerError> {
        // Dropping the writer closes the engine's stdin, which is its
        // signal to exit.
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        match time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "protocol engine exited");
                Ok(())
            }
            Ok(Err(source)) => Err(ControllerError::Stop(source)),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ControllerError::StopTimeout {
                    timeout: STOP_TIMEOUT,
                })
            }
        }
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(frame) = rx.recv().await {
        let line = frame.to_string();
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }

    let _ = stdin.shutdown().await;
}

async fn reader_task(stdout: ChildStdout, events: mpsc::UnboundedSender<Event>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match Event::parse(&line) {
            Ok(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(error) => warn!(%error, line, "discarding malformed engine output"),
        }
    }
    debug!("engine stdout closed");
}

async fn stderr_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "ofkit::backend", "{line}");
    }
}
