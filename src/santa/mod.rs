//! Secret Santa: registration, exclusion-aware pairing and anonymous relays.

pub mod engine;
pub mod error;
pub mod pairing;
pub mod relay;
pub mod session;


pub use engine::{SantaEngine, SessionTemplate};
pub use error::{SantaError, StartReport};
pub use pairing::PairingLimits;
pub use relay::{Destination, RelayTarget};
pub use session::{ExclusionSet, Identity};
