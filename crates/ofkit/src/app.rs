use async_trait::async_trait;
use thiserror::Error;

use crate::{controller::ControllerHandle, datapath::Datapath, error::ControllerError, event::Event};

/// Control-flow outcome of a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler declined the event; dispatch continues with the next
    /// handler.
    #[error("handler declined the event")]
    FallThrough,
    /// Stop dispatching the current event to further handlers.
    #[error("handler stopped dispatch")]
    Break,
    /// Handler failure, routed to [`App::on_exception`].
    #[error(transparent)]
    App(#[from] anyhow::Error),
}

impl From<ControllerError> for HandlerError {
    fn from(error: ControllerError) -> Self {
        HandlerError::App(error.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// An application contributing event handlers to the controller.
///
/// Apps are registered at build time and are immutable afterwards. Event
/// handlers are synchronous; work that needs to await must be spawned with
/// [`ControllerHandle::create_task`] or [`Datapath::create_task`]. The
/// lifecycle hooks `on_start` and `on_stop` are async and awaited outside
/// the dispatch loop, before the first event and after the drain.
#[async_trait]
pub trait App: Send + 'static {
    fn name(&self) -> &str {
        "app"
    }

    /// Whether OpenFlow messages of the given type should be delivered to
    /// [`App::on_message`]. Consulted once per message type; the answer is
    /// cached for the lifetime of the controller.
    fn handles(&self, _message_type: &str) -> bool {
        false
    }

    async fn on_start(&mut self, _controller: &ControllerHandle) -> HandlerResult {
        Ok(())
    }

    async fn on_stop(&mut self, _controller: &ControllerHandle) -> HandlerResult {
        Ok(())
    }

    fn on_channel_up(
        &mut self,
        _controller: &ControllerHandle,
        _dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        Ok(())
    }

    fn on_channel_down(
        &mut self,
        _controller: &ControllerHandle,
        _dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        Ok(())
    }

    /// Channel alert. The default declines so the framework can log alerts
    /// nobody handled.
    fn on_channel_alert(
        &mut self,
        _controller: &ControllerHandle,
        _dp: Option<&Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        Err(HandlerError::FallThrough)
    }

    fn on_packet_in(
        &mut self,
        _controller: &ControllerHandle,
        _dp: Option<&Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        Ok(())
    }

    fn on_port_status(
        &mut self,
        _controller: &ControllerHandle,
        _dp: &Datapath,
        _event: &Event,
    ) -> HandlerResult {
        Ok(())
    }

    /// OpenFlow messages of the types declared via [`App::handles`].
    fn on_message(
        &mut self,
        _controller: &ControllerHandle,
        _dp: Option<&Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        Ok(())
    }

    /// Synthetic events: phase markers and user-posted events.
    fn on_event(&mut self, _controller: &ControllerHandle, _event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Handler or task failure. Return true when this app consumed the
    /// error; unconsumed errors are logged by the framework.
    fn on_exception(&mut self, _error: &anyhow::Error) -> bool {
        false
    }
}
