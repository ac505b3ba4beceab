//! # Kiosk Session
//!
//! Conversation state, the server control protocol and the coordinator that
//! gates both audio directions against it.
//!
//! ## Modules:
//! - **state**: the closed set of order states and the transition table
//! - **protocol**: JSON control messages on the session WebSocket
//! - **ui**: events forwarded to the display layer
//! - **coordinator**: the state machine driving capture and playback
//! - **runner**: the WebSocket session loop and restart policy

pub mod coordinator;
pub mod protocol;
pub mod runner;
pub mod state;
pub mod ui;

pub use coordinator::{Outbound, SessionCoordinator, SessionSettings, SessionSnapshot};
pub use protocol::ControlEvent;
pub use runner::{run_kiosk, SessionOutcome, UserAction, UserRequest};
pub use state::{SessionEvent, SessionState};
pub use ui::{UiEvent, UiView};
