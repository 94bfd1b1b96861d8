//! Outbound notification seam.
//!
//! The engine only needs "deliver this text to identity X, optionally with
//! action buttons"; the actual chat transport lives in the application
//! crate. Delivery failures are logged by callers and never affect a
//! committed subscription transition.

use async_trait::async_trait;
use thiserror::Error;

/// Notification delivery failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("recipient {0} unreachable")]
    Unreachable(i64),
}

/// A single inline action button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Button {
    /// Fires a callback event carrying the given payload.
    Callback { label: String, data: String },
    /// Opens an external link.
    Url { label: String, url: String },
}

impl Button {
    pub fn callback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Button::Callback {
            label: label.into(),
            data: data.into(),
        }
    }

    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Button::Url {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Rows of inline buttons attached to a message.
pub type Keyboard = Vec<Vec<Button>>;

/// Push-delivery sink for user and administrator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: i64,
        text: &str,
        buttons: Option<Keyboard>,
    ) -> Result<(), DeliveryError>;
}
