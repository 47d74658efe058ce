use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::reply::ReplyError;

/// Exit status returned by [`crate::Controller::run`] on a clean shutdown.
pub const EXIT_STATUS_OK: i32 = 0;
/// Exit status returned when the run fails outside the controlled
/// start-failure path.
pub const EXIT_STATUS_ERROR: i32 = 10;

/// Errors surfaced by the controller and its transport.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("backend binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backend stdin unavailable")]
    StdinUnavailable,
    #[error("backend stdout unavailable")]
    StdoutUnavailable,
    #[error("backend connection closed")]
    ChannelClosed,
    #[error("failed to stop backend: {0}")]
    Stop(#[source] std::io::Error),
    #[error("timed out stopping backend after {timeout:?}")]
    StopTimeout { timeout: Duration },
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
    #[error("unsupported backend API version {major}.{minor}")]
    ApiVersion { major: u64, minor: u64 },
    #[error("xid {0} already registered")]
    DuplicateXid(u32),
    #[error("message requires a type")]
    MissingType,
    #[error("message must carry a datapath_id or conn_id")]
    NoDatapath,
    #[error("datapath {0} is closed")]
    DatapathClosed(crate::datapath::DatapathId),
    #[error("connection {0} already registered")]
    DuplicateConn(u64),
    #[error("datapath {0} already registered")]
    DuplicateDatapath(crate::datapath::DatapathId),
    #[error("invalid datapath id `{0}`")]
    BadDatapathId(String),
    #[error("channel up event missing conn_id or datapath_id")]
    MalformedChannelUp,
    #[error(transparent)]
    Reply(#[from] ReplyError),
}
