//! Server-held payment claims.
//!
//! A claim is created when a user reports a manual transfer, and is
//! actionable by the administrator exactly once: `take` removes it, so a
//! replayed confirmation (or a confirmation after a rejection) finds
//! nothing. Chat callback payloads only ever carry the opaque claim id.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::models::PayChannel;

/// Claims older than this are dropped unconfirmed.
const CLAIM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// An unconfirmed assertion by a user that a payment was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentClaim {
    pub user_id: i64,
    /// Chat display name, for the administrator's review message.
    pub username: Option<String>,
    pub amount: u32,
    /// Transfer comment the user was told to include.
    pub unique_id: String,
    pub channel: PayChannel,
}

/// Short id the user puts in the transfer comment so the administrator can
/// match the incoming payment.
pub fn new_transfer_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

struct Entry {
    claim: PaymentClaim,
    created_at: Instant,
}

/// In-memory claim store keyed by opaque claim id.
pub struct ClaimStore {
    claims: DashMap<String, Entry>,
    ttl: Duration,
}

impl ClaimStore {
    pub fn new() -> Self {
        Self::with_ttl(CLAIM_TTL)
    }

    fn with_ttl(ttl: Duration) -> Self {
        Self {
            claims: DashMap::new(),
            ttl,
        }
    }

    /// Store a claim and return its opaque id.
    pub fn create(&self, claim: PaymentClaim) -> String {
        self.sweep();
        let id = Uuid::new_v4().simple().to_string();
        self.claims.insert(
            id.clone(),
            Entry {
                claim,
                created_at: Instant::now(),
            },
        );
        id
    }

    /// Look at a claim without consuming it.
    pub fn get(&self, id: &str) -> Option<PaymentClaim> {
        self.claims
            .get(id)
            .filter(|entry| entry.created_at.elapsed() < self.ttl)
            .map(|entry| entry.claim.clone())
    }

    /// Remove and return a claim. Each claim can be taken at most once.
    pub fn take(&self, id: &str) -> Option<PaymentClaim> {
        self.claims
            .remove(id)
            .filter(|(_, entry)| entry.created_at.elapsed() < self.ttl)
            .map(|(_, entry)| entry.claim)
    }

    /// Drop expired claims.
    fn sweep(&self) {
        self.claims
            .retain(|_, entry| entry.created_at.elapsed() < self.ttl);
    }
}

impl Default for ClaimStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_claim() -> PaymentClaim {
        PaymentClaim {
            user_id: 7,
            username: Some("alice".into()),
            amount: 300,
            unique_id: new_transfer_id(),
            channel: PayChannel::Sbp,
        }
    }

    #[test]
    fn transfer_id_is_short_and_hex() {
        let id = new_transfer_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn claim_round_trips_by_id() {
        let store = ClaimStore::new();
        let claim = sample_claim();
        let id = store.create(claim.clone());

        assert_eq!(store.get(&id), Some(claim.clone()));
        // `get` does not consume.
        assert_eq!(store.get(&id), Some(claim));
    }

    #[test]
    fn take_consumes_exactly_once() {
        let store = ClaimStore::new();
        let id = store.create(sample_claim());

        assert!(store.take(&id).is_some());
        assert!(store.take(&id).is_none(), "second take must find nothing");
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn expired_claims_are_not_returned() {
        let store = ClaimStore::with_ttl(Duration::ZERO);
        let id = store.create(sample_claim());

        assert!(store.get(&id).is_none());
        assert!(store.take(&id).is_none());
    }
}
