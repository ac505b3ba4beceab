//! # Order Conversation States
//!
//! The closed set of states a kiosk session moves through and the transition
//! table for locally fired events.
//!
//! | Current               | Event            | Next                  |
//! |-----------------------|------------------|-----------------------|
//! | `MenuSelection`       | `ConfirmPayment` | `PaymentConfirmation` |
//! | `MenuSelection`       | `Cancel`         | `Cancelled`           |
//! | `PaymentConfirmation` | `ProcessPayment` | `Completed`           |
//! | `PaymentConfirmation` | `Previous`       | `MenuSelection`       |
//! | `PaymentConfirmation` | `Cancel`         | `Cancelled`           |
//! | `Completed`           | `Cancel`         | `MenuSelection`       |
//! | `Cancelled`           | `Previous`       | `MenuSelection`       |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the customer is in the order conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    MenuSelection,
    PaymentConfirmation,
    Completed,
    Cancelled,
}

/// Events that drive the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    ConfirmPayment,
    ProcessPayment,
    Previous,
    Cancel,
}

impl SessionState {
    pub const ALL: [SessionState; 4] = [
        SessionState::MenuSelection,
        SessionState::PaymentConfirmation,
        SessionState::Completed,
        SessionState::Cancelled,
    ];

    /// Next state for `event`, or `None` when the table has no row for it.
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (MenuSelection, ConfirmPayment) => Some(PaymentConfirmation),
            (MenuSelection, Cancel) => Some(Cancelled),
            (PaymentConfirmation, ProcessPayment) => Some(Completed),
            (PaymentConfirmation, Previous) => Some(MenuSelection),
            (PaymentConfirmation, Cancel) => Some(Cancelled),
            (Completed, Cancel) => Some(MenuSelection),
            (Cancelled, Previous) => Some(MenuSelection),
            _ => None,
        }
    }

    /// True when some single event leads from `self` to `target`.
    pub fn can_reach(self, target: SessionState) -> bool {
        [
            SessionEvent::ConfirmPayment,
            SessionEvent::ProcessPayment,
            SessionEvent::Previous,
            SessionEvent::Cancel,
        ]
        .into_iter()
        .any(|event| self.next(event) == Some(target))
    }

    /// Wire name, e.g. `PAYMENT_CONFIRMATION`.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::MenuSelection => "MENU_SELECTION",
            SessionState::PaymentConfirmation => "PAYMENT_CONFIRMATION",
            SessionState::Completed => "COMPLETED",
            SessionState::Cancelled => "CANCELLED",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::MenuSelection
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown session state: {}", s))
    }
}
