//! Reactive hub: floods every packet out of all ports.
//!
//! On channel up the app installs a table-miss flow that punts packets to
//! the controller; each PACKET_IN is answered with a PACKET_OUT flooding
//! the payload.
//!
//! Requires an `oftr`-style protocol engine on `PATH` (or `--backend`).
//!
//! ```bash
//! cargo run -p ofkit --example hub -- --listen 6653
//! ```

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;

use ofkit::{
    App, BackendConfig, Configuration, Controller, ControllerHandle, Datapath, Event,
    HandlerResult,
};

#[derive(Parser)]
struct Args {
    /// Listen endpoints (host:port or bare port).
    #[arg(long, default_value = "6653")]
    listen: Vec<String>,
    /// Path to the protocol engine binary.
    #[arg(long, default_value = "oftr")]
    backend: PathBuf,
}

struct Hub;

impl App for Hub {
    fn name(&self) -> &str {
        "hub"
    }

    fn on_channel_up(
        &mut self,
        _controller: &ControllerHandle,
        dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        let table_miss = Event::message("FLOW_MOD").with(
            "msg",
            json!({
                "table_id": 0,
                "command": "ADD",
                "priority": 0,
                "match": [],
                "instructions": [{
                    "instruction": "APPLY_ACTIONS",
                    "actions": [{
                        "action": "OUTPUT",
                        "port_no": "CONTROLLER",
                        "max_len": "NO_BUFFER",
                    }],
                }],
            }),
        );
        dp.send(table_miss)?;
        Ok(())
    }

    fn on_packet_in(
        &mut self,
        _controller: &ControllerHandle,
        dp: Option<&Datapath>,
        event: &Event,
    ) -> HandlerResult {
        let Some(dp) = dp else {
            return Ok(());
        };
        let Some(msg) = event.get("msg") else {
            return Ok(());
        };

        let flood = Event::message("PACKET_OUT").with(
            "msg",
            json!({
                "in_port": msg.get("in_port"),
                "actions": [{"action": "OUTPUT", "port_no": "ALL"}],
                "data": msg.get("data"),
            }),
        );
        dp.send(flood)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Configuration {
        listen_endpoints: args.listen,
        backend: BackendConfig {
            binary: args.backend,
            ..BackendConfig::default()
        },
        ..Configuration::default()
    };

    let status = Controller::builder().config(config).app(Hub).build().run().await;
    std::process::exit(status);
}
