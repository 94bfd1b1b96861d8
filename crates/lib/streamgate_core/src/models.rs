//! Domain models shared across the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format used when showing expiry timestamps to people.
pub const EXPIRY_DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Derive the media-server login for a chat identity.
pub fn login_for(user_id: i64) -> String {
    format!("User{user_id}")
}

/// One entitlement record: who may log in, with which secret, until when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Media-server login; primary key of the store.
    pub login: String,
    /// Chat identity that owns the login. Admin-created accounts have none.
    pub user_id: Option<i64>,
    pub credential: String,
    pub expires_at: DateTime<Utc>,
    pub is_trial: bool,
}

impl Entitlement {
    /// Whether the record grants access at `now`.
    ///
    /// A physically present record with a past expiry is logically revoked;
    /// callers must never trust presence alone.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Manual payment channels the administrator settles by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayChannel {
    /// Bank transfer by phone number.
    Sbp,
    /// Wallet transfer.
    Wallet,
}

impl PayChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayChannel::Sbp => "sbp",
            PayChannel::Wallet => "wallet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sbp" => Some(PayChannel::Sbp),
            "wallet" => Some(PayChannel::Wallet),
            _ => None,
        }
    }

    /// Currency the channel's tariff amounts are denominated in.
    pub fn currency(&self) -> &'static str {
        match self {
            PayChannel::Sbp => "RUB",
            PayChannel::Wallet => "USDT",
        }
    }
}

impl fmt::Display for PayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
