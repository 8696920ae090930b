//! The Secret Santa engine: registration, pairing and session lifecycle.
//!
//! Mutations take a process-local lock, read the stored session, apply the
//! change and write it back. Lookups read the last published snapshot and
//! never wait on the lock.

use rand::{RngCore, SeedableRng};
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::messenger::Messenger;
use crate::santa::error::{DeliveryStatus, SantaError, StartReport};
use crate::santa::pairing::{PairingLimits, compute_assignment, ring_to_assignment};
use crate::santa::relay::{self, Destination, RelayTarget};
use crate::santa::session::{ChannelId, ExclusionSet, Identity, Participant, Session};
use crate::store::KeyValueStore;

/// Store key of the session blob.
pub const SESSION_KEY: &str = "santa:session";

/// Configured defaults for a fresh session.
#[derive(Debug, Clone, Default)]
pub struct SessionTemplate {
    pub primary_channel: ChannelId,
    pub exclusions: ExclusionSet,
}

/// Summary for `/ss status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub started: bool,
    pub participants: usize,
    pub channel: ChannelId,
}

pub struct SantaEngine {
    store: Arc<dyn KeyValueStore>,
    template: SessionTemplate,
    limits: PairingLimits,
    write_lock: tokio::sync::Mutex<()>,
    snapshot: RwLock<Session>,
    rng: Mutex<StdRng>,
}

impl SantaEngine {
    pub fn new(store: Arc<dyn KeyValueStore>, template: SessionTemplate, limits: PairingLimits) -> Self {
        let snapshot = Session::new(template.primary_channel, template.exclusions.clone());
        Self {
            store,
            template,
            limits,
            write_lock: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(snapshot),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed RNG seed.
    #[cfg(test)]
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    // ==================== PERSISTENCE ====================

    /// Load the stored session, creating it from the template if absent.
    pub async fn init_session(&self) -> Result<SessionStatus, SantaError> {
        let _guard = self.write_lock.lock().await;
        let session = match self.store.get(SESSION_KEY)? {
            Some(_) => self.load()?,
            None => {
                let session = self.fresh_session();
                self.persist(&session)?;
                info!("Created new Secret Santa session (channel {})", session.primary_channel);
                session
            }
        };
        let status = status_of(&session);
        self.publish(session);
        Ok(status)
    }

    /// Re-read the store into the snapshot (picks up out-of-band edits).
    pub async fn reload(&self) -> Result<SessionStatus, SantaError> {
        let _guard = self.write_lock.lock().await;
        let session = self.load()?;
        let status = status_of(&session);
        self.publish(session);
        info!("Reloaded Secret Santa session ({} participants)", status.participants);
        Ok(status)
    }

    fn fresh_session(&self) -> Session {
        Session::new(self.template.primary_channel, self.template.exclusions.clone())
    }

    fn load(&self) -> Result<Session, SantaError> {
        let Some(json) = self.store.get(SESSION_KEY)? else {
            return Ok(self.fresh_session());
        };
        let mut session = Session::from_json(&json)?;

        if session.primary_channel == 0 {
            session.primary_channel = self.template.primary_channel;
        }
        // Blacklists come from config, but a running exchange keeps the ones it was paired with.
        if !session.started {
            session.exclusions = self.template.exclusions.clone();
        }
        Ok(session)
    }

    fn persist(&self, session: &Session) -> Result<(), SantaError> {
        self.store.set(SESSION_KEY, &session.to_json()?)?;
        Ok(())
    }

    fn publish(&self, session: Session) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snapshot = session;
    }

    fn read<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        f(&snapshot)
    }

    /// Serialized read-modify-write. `apply` returns its result and whether
    /// the session changed; unchanged sessions are not written back.
    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Session) -> Result<(T, bool), SantaError>,
    ) -> Result<T, SantaError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.load()?;
        let (result, changed) = apply(&mut session)?;
        if changed {
            self.persist(&session)?;
        }
        self.publish(session);
        Ok(result)
    }

    // ==================== REGISTRATION ====================

    /// Insert or overwrite a participant. True if they were not registered before.
    pub async fn register(
        &self,
        identity: Identity,
        display_name: &str,
        shipping_address: &str,
        notes: &str,
    ) -> Result<bool, SantaError> {
        let participant = Participant {
            identity,
            display_name: display_name.trim().to_string(),
            shipping_address: shipping_address.trim().to_string(),
            notes: notes.trim().to_string(),
        };
        let is_new = self
            .mutate(|session| {
                if session.started {
                    return Err(SantaError::SessionLocked);
                }
                let previous = session.participants.insert(identity, participant);
                Ok((previous.is_none(), true))
            })
            .await?;

        info!("🎅 {} santa {}", if is_new { "Registered" } else { "Updated" }, identity);
        Ok(is_new)
    }

    /// Remove a participant. True if one was removed.
    pub async fn unregister(&self, identity: Identity) -> Result<bool, SantaError> {
        let removed = self
            .mutate(|session| {
                if session.started {
                    return Err(SantaError::SessionLocked);
                }
                let removed = session.participants.remove(&identity).is_some();
                Ok((removed, removed))
            })
            .await?;

        if removed {
            info!("Unregistered santa {}", identity);
        }
        Ok(removed)
    }

    pub fn is_registered(&self, identity: Identity) -> bool {
        self.read(|s| s.is_registered(identity))
    }

    pub fn count(&self) -> usize {
        self.read(|s| s.participants.len())
    }

    pub fn participant(&self, identity: Identity) -> Option<Participant> {
        self.read(|s| s.participants.get(&identity).cloned())
    }

    // ==================== LIFECYCLE ====================

    pub fn started(&self) -> bool {
        self.read(|s| s.started)
    }

    /// Pair everyone and privately tell each giver who they shop for.
    ///
    /// The pairing is persisted before any notification goes out; failed
    /// deliveries are reported, never rolled back.
    pub async fn start(&self, messenger: &dyn Messenger) -> Result<StartReport, SantaError> {
        let session = {
            let _guard = self.write_lock.lock().await;
            let mut session = self.load()?;
            if session.started {
                return Err(SantaError::SessionLocked);
            }

            let ring = self.search(&session).await?;
            session.pairing = ring_to_assignment(&ring);
            session.started = true;
            self.persist(&session)?;
            self.publish(session.clone());
            session
        };

        info!("🎄 Secret Santa started with {} participants", session.participants.len());

        let mut report = StartReport::default();
        for (giver, receiver) in &session.pairing {
            let Some(target) = session.participants.get(receiver) else {
                continue;
            };
            let status = match messenger.send_direct_message(*giver, &assignment_notice(target)).await {
                Ok(_) => {
                    debug!("Sent assignment to santa {}", giver);
                    DeliveryStatus::Delivered
                }
                Err(e) => {
                    warn!("Failed to notify santa {}: {}", giver, e);
                    DeliveryStatus::Failed(e)
                }
            };
            report.deliveries.push((*giver, status));
        }

        Ok(report)
    }

    /// Clear participants and pairing. Idempotent.
    pub async fn reset(&self) -> Result<(), SantaError> {
        self.mutate(|session| {
            session.clear();
            // A started session kept the blacklists it was paired under.
            session.exclusions = self.template.exclusions.clone();
            Ok(((), true))
        })
        .await?;
        info!("Secret Santa session reset");
        Ok(())
    }

    /// Admin override: give `giver` the receiver `receiver`.
    ///
    /// The previous giver of `receiver` inherits `giver`'s old receiver, so
    /// the assignment stays a permutation.
    pub async fn set_receiver(&self, giver: Identity, receiver: Identity) -> Result<(), SantaError> {
        self.mutate(|session| {
            if !session.started {
                return Err(SantaError::NotStarted);
            }
            for id in [giver, receiver] {
                if !session.is_registered(id) {
                    return Err(SantaError::InvalidOverride(format!("{id} is not registered")));
                }
            }
            if giver == receiver {
                return Err(SantaError::InvalidOverride("cannot assign a santa to themself".into()));
            }

            let (Some(old_receiver), Some(other_giver)) =
                (session.receiver_of(giver), session.giver_of(receiver))
            else {
                return Err(SantaError::InvalidOverride("pairing is incomplete".into()));
            };
            if old_receiver == receiver {
                return Ok(((), false));
            }
            if other_giver == old_receiver {
                return Err(SantaError::InvalidOverride(format!(
                    "{other_giver} would have to give to themself"
                )));
            }
            for (g, r) in [(giver, receiver), (other_giver, old_receiver)] {
                if session.is_excluded(g, r) {
                    return Err(SantaError::InvalidOverride(format!("{g} -> {r} is blacklisted")));
                }
            }

            session.pairing.insert(giver, receiver);
            session.pairing.insert(other_giver, old_receiver);
            Ok(((), true))
        })
        .await?;

        info!("Pairing override applied for santa {}", giver);
        Ok(())
    }

    // ==================== LOOKUPS ====================

    pub fn get_receiver(&self, giver: Identity) -> Option<Identity> {
        self.read(|s| s.receiver_of(giver))
    }

    pub fn get_giver(&self, receiver: Identity) -> Option<Identity> {
        self.read(|s| s.giver_of(receiver))
    }

    /// Same as `get_giver`: the Santa shopping for `receiver`.
    pub fn get_santa(&self, receiver: Identity) -> Option<Identity> {
        self.get_giver(receiver)
    }

    pub fn get_channel_id(&self) -> ChannelId {
        self.read(|s| s.primary_channel)
    }

    pub fn get_blacklists(&self) -> ExclusionSet {
        self.read(|s| s.exclusions.clone())
    }

    /// Candidate ring over the current registrants; nothing is stored.
    pub async fn preview(&self) -> Result<Vec<Participant>, SantaError> {
        let session = self.read(Session::clone);
        let ring = self.search(&session).await?;
        Ok(ring
            .iter()
            .filter_map(|id| session.participants.get(id).cloned())
            .collect())
    }

    /// Run the pairing search on the blocking pool; it can take a while
    /// with dense blacklists.
    async fn search(&self, session: &Session) -> Result<Vec<Identity>, SantaError> {
        let members: Vec<Identity> = session.participants.keys().copied().collect();
        let exclusions = session.exclusions.clone();
        let limits = self.limits;
        let mut rng = {
            let mut shared = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            StdRng::seed_from_u64(shared.next_u64())
        };
        tokio::task::spawn_blocking(move || compute_assignment(&members, &exclusions, &limits, &mut rng))
            .await
            .map_err(|e| SantaError::SearchAborted(e.to_string()))?
    }

    /// Where a relay from `requester` should go.
    pub fn relay_destination(&self, requester: Identity, target: RelayTarget) -> Result<Destination, SantaError> {
        self.read(|s| relay::resolve(s, requester, target))
    }
}

fn status_of(session: &Session) -> SessionStatus {
    SessionStatus {
        started: session.started,
        participants: session.participants.len(),
        channel: session.primary_channel,
    }
}

/// Private message telling a giver who they shop for.
pub fn assignment_notice(receiver: &Participant) -> String {
    let notes = if receiver.notes.is_empty() { "(none)" } else { receiver.notes.as_str() };
    format!(
        "🎅 Secret Santa has started!\n\n\
         You are the Secret Santa for: {}\n\
         Shipping address: {}\n\
         Notes: {}\n\n\
         Message them anonymously with /ss receiver <message>.",
        receiver.display_name, receiver.shipping_address, notes
    )
}
