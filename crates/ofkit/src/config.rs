use std::{path::PathBuf, time::Duration};

/// TLS identity material forwarded to the protocol engine at start.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Certificate chain (PEM contents).
    pub cert: String,
    /// Certificate authority (PEM contents).
    pub cacert: String,
    /// Private key (PEM contents).
    pub privkey: String,
}

/// How to launch the protocol engine subprocess.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Engine binary; resolved through `PATH` when relative.
    pub binary: PathBuf,
    /// Arguments passed to the engine.
    pub args: Vec<String>,
    /// Optional launch prefix, e.g. `["valgrind"]` or `["strace", "-f"]`.
    pub prefix: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("oftr"),
            args: vec!["jsonrpc".to_string()],
            prefix: Vec::new(),
        }
    }
}

/// Signals that request controller shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitSignal {
    /// SIGTERM: post a graceful exit.
    Terminate,
    /// SIGINT: cancel the interruptible task when one is registered,
    /// otherwise behave like [`ExitSignal::Terminate`].
    Interrupt,
}

/// Controller configuration. Plain data; construct with struct update
/// syntax over [`Configuration::default`].
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Endpoints to listen on (`host:port` or bare port).
    pub listen_endpoints: Vec<String>,
    /// OpenFlow versions offered on listen (1-6). Empty means use the
    /// versions advertised by the engine.
    pub listen_versions: Vec<u8>,
    /// Listen options forwarded verbatim.
    pub listen_options: Vec<String>,
    pub tls: Option<TlsConfig>,
    /// Deadline applied to every registered request.
    pub request_timeout: Duration,
    pub exit_signals: Vec<ExitSignal>,
    pub backend: BackendConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            listen_endpoints: vec!["6633".to_string(), "6653".to_string()],
            listen_versions: Vec::new(),
            listen_options: vec!["FEATURES_REQ".to_string()],
            tls: None,
            request_timeout: Duration::from_secs(10),
            exit_signals: vec![ExitSignal::Terminate, ExitSignal::Interrupt],
            backend: BackendConfig::default(),
        }
    }
}
