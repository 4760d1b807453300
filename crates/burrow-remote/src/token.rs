//! Short-lived attach tokens.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use burrow_common::error::{BurrowError, Result};

use crate::wire::AttachToken;

/// What a token grants access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    /// Container id.
    pub container: String,
    /// Task id within the container.
    pub task: String,
}

#[derive(Debug)]
struct Entry {
    target: AttachTarget,
    expires: Instant,
}

/// Expiring map from attach token to the task it opens.
///
/// A token may be redeemed any number of times until it expires; expired
/// entries are dropped whenever a token is issued or presented.
#[derive(Debug)]
pub struct TokenCache {
    ttl: Duration,
    entries: Mutex<HashMap<AttachToken, Entry>>,
}

impl TokenCache {
    /// Creates a cache whose tokens live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<AttachToken, Entry>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires > now);
        entries
    }

    /// Issues a fresh token for `task` in `container`.
    pub fn issue(&self, container: &str, task: &str) -> AttachToken {
        let token = AttachToken::random();
        let _ = self.entries().insert(
            token,
            Entry {
                target: AttachTarget {
                    container: container.to_string(),
                    task: task.to_string(),
                },
                expires: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Looks up what `token` grants.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::InvalidToken`] for unknown or expired tokens.
    pub fn redeem(&self, token: &AttachToken) -> Result<AttachTarget> {
        self.entries()
            .get(token)
            .map(|entry| entry.target.clone())
            .ok_or(BurrowError::InvalidToken)
    }

    /// Number of unexpired tokens.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if no unexpired token exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
