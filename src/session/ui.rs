//! Events forwarded to the kiosk's display layer.
//!
//! The engine does not render anything. Captions, cart snapshots and state
//! changes are pushed over an unbounded channel and whoever drives the screen
//! consumes them.

use super::state::SessionState;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// One update for the display layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UiEvent {
    /// Replace the caption text
    CaptionReplace(String),
    /// Append to the caption text
    CaptionAppend(String),
    /// New cart snapshot, as sent by the server
    Cart(Value),
    /// The conversation moved to another state
    State {
        from: SessionState,
        to: SessionState,
    },
}

pub type UiSender = mpsc::UnboundedSender<UiEvent>;
pub type UiReceiver = mpsc::UnboundedReceiver<UiEvent>;

/// Unbounded channel from the coordinator to the UI task.
pub fn ui_channel() -> (UiSender, UiReceiver) {
    mpsc::unbounded_channel()
}

/// What the screen currently shows, folded from [`UiEvent`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UiView {
    pub caption: String,
    pub cart: Option<Value>,
    pub state: SessionState,
}

impl UiView {
    /// Update the view with one event.
    pub fn apply(&mut self, event: &UiEvent) {
        match event {
            UiEvent::CaptionReplace(text) => self.caption = text.clone(),
            UiEvent::CaptionAppend(text) => self.caption.push_str(text),
            UiEvent::Cart(cart) => self.cart = Some(cart.clone()),
            UiEvent::State { to, .. } => self.state = *to,
        }
    }
}
