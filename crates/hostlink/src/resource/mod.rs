//! Exclusive/shared resource locks shared across workers.
//!
//! A [`ResourceStub`] is the pure per-resource state machine; a [`ResourceArbiter`]
//! owns the stubs of one namespace, drives their acquisition timers and reports
//! grants, forced releases and evictions as [`ResourceEvent`]s.

mod arbiter;
mod stub;

use serde::{Deserialize, Serialize};

pub use arbiter::{ResourceArbiter, ResourceEvent, StubSnapshot};
pub use stub::{AcquireOutcome, ResourceStub, Transition};

/// Opaque handle for one grant (active or queued) of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    sequence: u64,
    exclusive: bool,
    credential: String,
}

impl Token {
    pub(crate) fn new(sequence: u64, exclusive: bool, credential: impl Into<String>) -> Self {
        Self {
            sequence,
            exclusive,
            credential: credential.into(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Credential of the connection the token was issued to.
    pub fn credential(&self) -> &str {
        &self.credential
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.exclusive { "exclusive" } else { "shared" };
        write!(f, "{mode}#{}@{}", self.sequence, self.credential)
    }
}
