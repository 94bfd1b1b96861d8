//! Login secret generation.

use rand::distr::Alphanumeric;
use rand::{Rng, rng};

/// Length of credentials issued to new accounts.
pub const DEFAULT_CREDENTIAL_LEN: usize = 12;

/// Generate a random alphanumeric credential of `len` characters.
///
/// Draws from the thread-local CSPRNG, so no call is predictable from an
/// earlier one.
pub fn generate_credential(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
