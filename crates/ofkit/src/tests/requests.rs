use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    app::{App, HandlerResult},
    controller::{Controller, ControllerHandle},
    datapath::Datapath,
    error::EXIT_STATUS_OK,
    event::Event,
    reply::ReplyError,
};

use super::support::{
    contents, new_log, push, record, respond_openflow, test_config, EventLog, MockTransport,
};

/// Engine double that answers a flow request with a three-part reply: two
/// chunks flagged MORE, then the terminal chunk.
fn multipart_engine() -> MockTransport {
    MockTransport::new(|frame, events| {
        if respond_openflow(frame, events, false) {
            return;
        }
        if frame.get("method").and_then(Value::as_str) != Some("OFP.SEND") {
            return;
        }
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        if params.get("type").and_then(Value::as_str) != Some("REQUEST.FLOW_DESC") {
            return;
        }
        let xid = params.get("xid").cloned().unwrap_or(Value::Null);
        for (index, flags) in [json!(["MORE"]), json!(["MORE"]), json!([])]
            .into_iter()
            .enumerate()
        {
            push(
                events,
                json!({
                    "type": "REPLY.FLOW_DESC",
                    "conn_id": 2,
                    "xid": xid,
                    "flags": flags,
                    "msg": [index + 1],
                }),
            );
        }
    })
}

struct MultipartRequester {
    log: EventLog,
}

#[async_trait]
impl App for MultipartRequester {
    fn on_channel_up(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        let log = self.log.clone();
        let handle = controller.clone();
        let dp = dp.clone();
        dp.clone().create_task(async move {
            let mut reply = dp.request(Event::message("REQUEST.FLOW_DESC"))?;
            for _ in 0..3 {
                let value = reply.next().await?;
                record(&log, value["msg"][0].to_string());
            }
            match reply.next().await {
                Err(ReplyError::InvalidState(_)) => record(&log, "DONE"),
                other => record(&log, format!("unexpected: {other:?}")),
            }
            handle.shutdown();
            Ok(())
        });
        Ok(())
    }
}

#[tokio::test]
async fn multipart_request_yields_replies_in_order() {
    let log = new_log();
    let status = Controller::builder()
        .config(test_config())
        .app(MultipartRequester { log: log.clone() })
        .transport(multipart_engine())
        .build()
        .run()
        .await;

    assert_eq!(status, EXIT_STATUS_OK);
    assert_eq!(contents(&log), ["1", "2", "3", "DONE"]);
}

struct SilentRequester {
    log: EventLog,
}

#[async_trait]
impl App for SilentRequester {
    fn on_channel_up(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        let log = self.log.clone();
        let handle = controller.clone();
        let dp = dp.clone();
        dp.clone().create_task(async move {
            let mut reply = dp.request(Event::message("BARRIER_REQUEST"))?;
            match reply.next().await {
                Err(ReplyError::Timeout(_)) => record(&log, "TIMEOUT"),
                other => record(&log, format!("unexpected: {other:?}")),
            }
            handle.shutdown();
            Ok(())
        });
        Ok(())
    }
}

/// A request the engine never answers is aged out by the sweeper and is
/// indistinguishable from an engine-delivered error: terminal on the same
/// handle.
#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let log = new_log();
    let status = Controller::builder()
        .config(test_config())
        .app(SilentRequester { log: log.clone() })
        .transport(MockTransport::switch_stays_up())
        .build()
        .run()
        .await;

    assert_eq!(status, EXIT_STATUS_OK);
    assert_eq!(contents(&log), ["TIMEOUT"]);
}

/// Engine double that answers any request with a CHANNEL_ALERT naming its
/// xid.
fn alerting_engine() -> MockTransport {
    MockTransport::new(|frame, events| {
        if respond_openflow(frame, events, false) {
            return;
        }
        if frame.get("method").and_then(Value::as_str) != Some("OFP.SEND") {
            return;
        }
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        push(
            events,
            json!({
                "type": "CHANNEL_ALERT",
                "conn_id": 2,
                "xid": params.get("xid").cloned().unwrap_or(Value::Null),
                "alert": "message not delivered",
                "data": "00ff",
            }),
        );
    })
}

struct UndeliveredRequester {
    log: EventLog,
}

#[async_trait]
impl App for UndeliveredRequester {
    fn on_channel_up(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        let log = self.log.clone();
        let handle = controller.clone();
        let dp = dp.clone();
        dp.clone().create_task(async move {
            let mut reply = dp.request(Event::message("REQUEST.PORT_STATS"))?;
            match reply.next().await {
                Err(ReplyError::Delivery { .. }) => record(&log, "UNDELIVERED"),
                other => record(&log, format!("unexpected: {other:?}")),
            }
            handle.shutdown();
            Ok(())
        });
        Ok(())
    }
}

#[tokio::test]
async fn alert_with_matching_xid_is_a_delivery_failure() {
    let log = new_log();
    let status = Controller::builder()
        .config(test_config())
        .app(UndeliveredRequester { log: log.clone() })
        .transport(alerting_engine())
        .build()
        .run()
        .await;

    assert_eq!(status, EXIT_STATUS_OK);
    assert_eq!(contents(&log), ["UNDELIVERED"]);
}

/// An OpenFlow ERROR answering an outstanding request terminates the
/// handle instead of dispatching.
fn erroring_engine() -> MockTransport {
    MockTransport::new(|frame, events| {
        if respond_openflow(frame, events, false) {
            return;
        }
        if frame.get("method").and_then(Value::as_str) != Some("OFP.SEND") {
            return;
        }
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        push(
            events,
            json!({
                "type": "ERROR",
                "conn_id": 2,
                "xid": params.get("xid").cloned().unwrap_or(Value::Null),
                "msg": {"type": "BAD_REQUEST", "code": "BAD_TYPE"},
            }),
        );
    })
}

struct RejectedRequester {
    log: EventLog,
}

#[async_trait]
impl App for RejectedRequester {
    fn on_channel_up(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        let log = self.log.clone();
        let handle = controller.clone();
        let dp = dp.clone();
        dp.clone().create_task(async move {
            let mut reply = dp.request(Event::message("REQUEST.TABLE_STATS"))?;
            match reply.next().await {
                Err(ReplyError::Message { event, .. }) => {
                    record(&log, event.get("msg").and_then(|m| m.get("code")).and_then(Value::as_str).unwrap_or_default());
                }
                other => record(&log, format!("unexpected: {other:?}")),
            }
            handle.shutdown();
            Ok(())
        });
        Ok(())
    }
}

#[tokio::test]
async fn error_reply_terminates_the_request() {
    let log = new_log();
    let status = Controller::builder()
        .config(test_config())
        .app(RejectedRequester { log: log.clone() })
        .transport(erroring_engine())
        .build()
        .run()
        .await;

    assert_eq!(status, EXIT_STATUS_OK);
    assert_eq!(contents(&log), ["BAD_TYPE"]);
}
