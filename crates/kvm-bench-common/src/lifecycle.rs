//! VM lifecycle states and the allowed transitions between them
//!
//! ```text
//! Requested → Provisioning → Booting → Ready → Cleaning → Destroyed
//!      └──────────┴────────────┴─────────┴────────┴──→ Failed → Abandoned
//!                                                        └──→ Cleaning
//! ```
//!
//! States only move forward. The one exception is `Failed → Cleaning`, which
//! lets a failed instance still be torn down.

use serde::{Deserialize, Serialize};

/// State-machine position of a VM instance
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LifecycleState {
    /// Instance record created, nothing allocated yet
    #[default]
    Requested,
    /// Storage and domain definition in progress
    Provisioning,
    /// Domain started, waiting for the guest to become reachable
    Booting,
    /// Guest reachable, benchmarks may run
    Ready,
    /// Teardown in progress
    Cleaning,
    /// Domain stopped and storage removed
    Destroyed,
    /// Something went wrong; teardown still pending
    Failed,
    /// Teardown exhausted its retries; resources may be leaked
    Abandoned,
}

impl LifecycleState {
    /// Terminal states are never left again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Abandoned)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed) => self != Failed,
            (Failed, Cleaning | Abandoned) => true,
            (Requested, Provisioning) => true,
            (Provisioning, Booting) => true,
            (Booting, Ready) => true,
            // Teardown may begin from any live state (cancellation, readiness timeout)
            (Requested | Provisioning | Booting | Ready, Cleaning) => true,
            (Cleaning, Destroyed) => true,
            _ => false,
        }
    }
}
