//! Who may send anonymous Secret Santa messages, and where they go.

use crate::santa::error::SantaError;
use crate::santa::session::{ChannelId, Identity, Session};

/// The three anonymous relay channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTarget {
    /// The person the requester shops for.
    Receiver,
    /// The requester's own Santa.
    Santa,
    /// The shared Secret Santa channel.
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    User(Identity),
    Channel(ChannelId),
}

/// Relays need a registered requester and a started session.
pub fn resolve(session: &Session, requester: Identity, target: RelayTarget) -> Result<Destination, SantaError> {
    if !session.is_registered(requester) {
        return Err(SantaError::NotRegistered);
    }
    if !session.started {
        return Err(SantaError::NotStarted);
    }

    match target {
        RelayTarget::Receiver => session
            .receiver_of(requester)
            .map(Destination::User)
            .ok_or(SantaError::NotRegistered),
        RelayTarget::Santa => session
            .giver_of(requester)
            .map(Destination::User)
            .ok_or(SantaError::NotRegistered),
        RelayTarget::Channel => Ok(Destination::Channel(session.primary_channel)),
    }
}
