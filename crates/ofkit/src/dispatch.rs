use std::{collections::HashMap, sync::Arc};

use tracing::{debug, error, warn};

use crate::{
    app::{App, HandlerError, HandlerResult},
    controller::ControllerHandle,
    datapath::Datapath,
    event::Event,
};

/// Routes events to the registered apps.
///
/// Channel and lifecycle events go to their dedicated trait methods on
/// every app, in registration order. Other OpenFlow message types resolve
/// to the subset of apps that declared interest via [`App::handles`]; the
/// resolution is cached per type and stable for the controller's lifetime.
pub(crate) struct Dispatcher {
    apps: Vec<Box<dyn App>>,
    plans: HashMap<String, Arc<[usize]>>,
}

impl Dispatcher {
    pub(crate) fn new(apps: Vec<Box<dyn App>>) -> Self {
        Self {
            apps,
            plans: HashMap::new(),
        }
    }

    fn plan(&mut self, message_type: &str) -> Arc<[usize]> {
        if let Some(plan) = self.plans.get(message_type) {
            return Arc::clone(plan);
        }
        let plan: Arc<[usize]> = self
            .apps
            .iter()
            .enumerate()
            .filter(|(_, app)| app.handles(message_type))
            .map(|(index, _)| index)
            .collect();
        self.plans.insert(message_type.to_string(), Arc::clone(&plan));
        plan
    }

    /// Applies one handler outcome; returns true when dispatch of the
    /// current event should stop.
    fn apply(&mut self, outcome: HandlerResult, app_index: usize, handler: &str) -> bool {
        match outcome {
            Ok(()) => false,
            Err(HandlerError::FallThrough) => {
                debug!(app = self.apps[app_index].name(), handler, "handler fell through");
                false
            }
            Err(HandlerError::Break) => {
                debug!(app = self.apps[app_index].name(), handler, "handler stopped dispatch");
                true
            }
            Err(HandlerError::App(failure)) => {
                self.route_exception(failure);
                false
            }
        }
    }

    /// Hands a failure to the first app whose `on_exception` consumes it;
    /// logs it otherwise.
    pub(crate) fn route_exception(&mut self, error: anyhow::Error) {
        for app in &mut self.apps {
            if app.on_exception(&error) {
                return;
            }
        }
        error!(%error, "unhandled exception in handler");
    }

    pub(crate) fn dispatch_channel_up(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        event: &Event,
    ) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_channel_up(controller, dp, event);
            if self.apply(outcome, index, "on_channel_up") {
                break;
            }
        }
    }

    pub(crate) fn dispatch_channel_down(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        event: &Event,
    ) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_channel_down(controller, dp, event);
            if self.apply(outcome, index, "on_channel_down") {
                break;
            }
        }
    }

    /// Dispatches an alert. When every app declines, the framework logs the
    /// alert itself with a truncated payload.
    pub(crate) fn dispatch_channel_alert(
        &mut self,
        controller: &ControllerHandle,
        dp: Option<&Datapath>,
        event: &Event,
    ) {
        let mut handled = false;
        for index in 0..self.apps.len() {
            match self.apps[index].on_channel_alert(controller, dp, event) {
                Ok(()) => handled = true,
                Err(HandlerError::FallThrough) => {}
                Err(HandlerError::Break) => {
                    handled = true;
                    break;
                }
                Err(HandlerError::App(failure)) => {
                    handled = true;
                    self.route_exception(failure);
                }
            }
        }
        if !handled {
            let data = event.get_str("data").unwrap_or_default();
            let shown = if data.len() > 100 { &data[..100] } else { data };
            warn!(
                alert = event.get_str("alert").unwrap_or_default(),
                conn_id = event.conn_id().unwrap_or_default(),
                xid = event.xid().unwrap_or_default(),
                data = shown,
                "channel alert"
            );
        }
    }

    pub(crate) fn dispatch_packet_in(
        &mut self,
        controller: &ControllerHandle,
        dp: Option<&Datapath>,
        event: &Event,
    ) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_packet_in(controller, dp, event);
            if self.apply(outcome, index, "on_packet_in") {
                break;
            }
        }
    }

    pub(crate) fn dispatch_port_status(
        &mut self,
        controller: &ControllerHandle,
        dp: &Datapath,
        event: &Event,
    ) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_port_status(controller, dp, event);
            if self.apply(outcome, index, "on_port_status") {
                break;
            }
        }
    }

    pub(crate) fn dispatch_message(
        &mut self,
        controller: &ControllerHandle,
        message_type: &str,
        dp: Option<&Datapath>,
        event: &Event,
    ) {
        let plan = self.plan(message_type);
        for &index in plan.iter() {
            let outcome = self.apps[index].on_message(controller, dp, event);
            if self.apply(outcome, index, "on_message") {
                break;
            }
        }
    }

    pub(crate) fn dispatch_event(&mut self, controller: &ControllerHandle, event: &Event) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_event(controller, event);
            if self.apply(outcome, index, "on_event") {
                break;
            }
        }
    }

    pub(crate) async fn invoke_start(&mut self, controller: &ControllerHandle) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_start(controller).await;
            if self.apply(outcome, index, "on_start") {
                break;
            }
        }
    }

    pub(crate) async fn invoke_stop(&mut self, controller: &ControllerHandle) {
        for index in 0..self.apps.len() {
            let outcome = self.apps[index].on_stop(controller).await;
            if self.apply(outcome, index, "on_stop") {
                break;
            }
        }
    }
}
