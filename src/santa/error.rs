use std::fmt;

use crate::santa::session::Identity;
use crate::store::StoreError;

/// Failures surfaced by the Secret Santa engine.
///
/// The engine never phrases these for users; `commands` owns the wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SantaError {
    /// Registration changes attempted after the session started.
    SessionLocked,
    /// Fewer than three registrants when a pairing was requested.
    InsufficientParticipants { count: usize },
    /// The requesting identity has no participant record.
    NotRegistered,
    /// A relay or lookup that needs a started session.
    NotStarted,
    /// Neither rejection sampling nor the backtracking search found a ring.
    NoValidPairing { attempts: usize },
    /// An admin edit of the pairing would break its invariants.
    InvalidOverride(String),
    /// The pairing search task panicked or was cancelled.
    SearchAborted(String),
    /// Reading or writing the persisted session failed.
    Store(StoreError),
}

impl fmt::Display for SantaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionLocked => write!(f, "session already started"),
            Self::InsufficientParticipants { count } => {
                write!(f, "not enough users registered ({count})")
            }
            Self::NotRegistered => write!(f, "not registered"),
            Self::NotStarted => write!(f, "session has not started"),
            Self::NoValidPairing { attempts } => {
                write!(f, "no valid pairing exists (gave up after {attempts} shuffles and a full search)")
            }
            Self::InvalidOverride(msg) => write!(f, "invalid pairing override: {msg}"),
            Self::SearchAborted(msg) => write!(f, "pairing search aborted: {msg}"),
            Self::Store(e) => write!(f, "session store error: {e}"),
        }
    }
}

impl std::error::Error for SantaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SantaError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Outcome of one assignment notification sent by `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed(String),
}

/// Per-giver delivery results of a successful `start`.
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    pub deliveries: Vec<(Identity, DeliveryStatus)>,
}

impl StartReport {
    pub fn delivered(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|(_, s)| *s == DeliveryStatus::Delivered)
            .count()
    }

    /// Givers whose notification could not be sent, with the reason.
    pub fn failures(&self) -> Vec<(Identity, &str)> {
        self.deliveries
            .iter()
            .filter_map(|(id, s)| match s {
                DeliveryStatus::Failed(reason) => Some((*id, reason.as_str())),
                DeliveryStatus::Delivered => None,
            })
            .collect()
    }
}
