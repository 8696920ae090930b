//! Secret Santa session state and its persisted JSON schema.
//!
//! Sessions are stored as a versioned JSON blob. Blobs written by the old
//! bot carry no `version` field and use camelCase keys with string ids; they
//! are migrated on load.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::store::StoreError;

/// Opaque chat user id of a participant.
pub type Identity = i64;
/// Chat id of the channel used for anonymous posts.
pub type ChannelId = i64;

/// Giver -> receivers that giver must never be assigned. Directional.
pub type ExclusionSet = BTreeMap<Identity, Vec<Identity>>;
/// Giver -> receiver.
pub type PairingAssignment = BTreeMap<Identity, Identity>;

pub const SCHEMA_VERSION: u32 = 1;

/// A registered Santa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub identity: Identity,
    pub display_name: String,
    pub shipping_address: String,
    pub notes: String,
}

/// One gift-exchange round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub participants: BTreeMap<Identity, Participant>,
    pub exclusions: ExclusionSet,
    pub pairing: PairingAssignment,
    pub started: bool,
    pub primary_channel: ChannelId,
}

impl Session {
    /// Empty session seeded with the configured channel and blacklists.
    pub fn new(primary_channel: ChannelId, exclusions: ExclusionSet) -> Self {
        Self {
            primary_channel,
            exclusions,
            ..Self::default()
        }
    }

    pub fn is_registered(&self, identity: Identity) -> bool {
        self.participants.contains_key(&identity)
    }

    pub fn is_excluded(&self, giver: Identity, receiver: Identity) -> bool {
        is_excluded(&self.exclusions, giver, receiver)
    }

    /// Receiver assigned to `giver`, absent before start.
    pub fn receiver_of(&self, giver: Identity) -> Option<Identity> {
        if !self.started {
            return None;
        }
        self.pairing.get(&giver).copied()
    }

    /// Giver assigned to `receiver`, absent before start.
    pub fn giver_of(&self, receiver: Identity) -> Option<Identity> {
        if !self.started {
            return None;
        }
        self.pairing
            .iter()
            .find(|(_, r)| **r == receiver)
            .map(|(g, _)| *g)
    }

    /// Back to the initial state, keeping channel and blacklists.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.pairing.clear();
        self.started = false;
    }

    /// Check the pairing invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.started != !self.pairing.is_empty() {
            return Err(format!(
                "started={} but pairing has {} edge(s)",
                self.started,
                self.pairing.len()
            ));
        }
        if !self.started {
            return Ok(());
        }

        let members: BTreeSet<Identity> = self.participants.keys().copied().collect();
        let givers: BTreeSet<Identity> = self.pairing.keys().copied().collect();
        let receivers: BTreeSet<Identity> = self.pairing.values().copied().collect();
        if givers != members || receivers != members {
            return Err("pairing is not a permutation of the participants".to_string());
        }

        for (giver, receiver) in &self.pairing {
            if giver == receiver {
                return Err(format!("{giver} is assigned to themself"));
            }
            if self.is_excluded(*giver, *receiver) {
                return Err(format!("{giver} -> {receiver} is blacklisted"));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        let record = SessionRecord {
            version: SCHEMA_VERSION,
            participants: self.participants.clone(),
            exclusions: self.exclusions.clone(),
            pairing: self.pairing.clone(),
            started: self.started,
            primary_channel: self.primary_channel,
        };
        serde_json::to_string_pretty(&record).map_err(|e| StoreError::Serialize(e.to_string()))
    }

    /// Parse a stored blob, migrating the legacy shape, then validate it.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| StoreError::Serialize(e.to_string()))?;

        let session = match value.get("version") {
            None => {
                let legacy: LegacySession = serde_json::from_value(value)
                    .map_err(|e| StoreError::Serialize(e.to_string()))?;
                legacy.migrate()?
            }
            Some(v) => {
                let version = v
                    .as_u64()
                    .ok_or_else(|| StoreError::Invalid(format!("bad schema version: {v}")))?;
                if version != u64::from(SCHEMA_VERSION) {
                    return Err(StoreError::UnsupportedVersion(version));
                }
                let record: SessionRecord = serde_json::from_value(value)
                    .map_err(|e| StoreError::Serialize(e.to_string()))?;
                record.into_session()
            }
        };

        session.validate().map_err(StoreError::Invalid)?;
        Ok(session)
    }
}

pub fn is_excluded(exclusions: &ExclusionSet, giver: Identity, receiver: Identity) -> bool {
    exclusions
        .get(&giver)
        .is_some_and(|blocked| blocked.contains(&receiver))
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    #[serde(default)]
    participants: BTreeMap<Identity, Participant>,
    #[serde(default)]
    exclusions: ExclusionSet,
    #[serde(default)]
    pairing: PairingAssignment,
    #[serde(default)]
    started: bool,
    #[serde(default)]
    primary_channel: ChannelId,
}

impl SessionRecord {
    fn into_session(self) -> Session {
        Session {
            participants: self.participants,
            exclusions: self.exclusions,
            pairing: self.pairing,
            started: self.started,
            primary_channel: self.primary_channel,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySanta {
    discord_id: String,
    #[serde(default, alias = "name")]
    real_name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySession {
    #[serde(default)]
    santas: HashMap<String, LegacySanta>,
    #[serde(default)]
    selected_pairs: HashMap<String, String>,
    #[serde(default)]
    game_started: bool,
    #[serde(default)]
    channel_id: Option<serde_json::Value>,
    #[serde(default)]
    blacklisted_pairs: HashMap<String, Vec<String>>,
}

fn parse_legacy_id(raw: &str) -> Result<Identity, StoreError> {
    raw.trim()
        .parse()
        .map_err(|_| StoreError::Invalid(format!("legacy id is not numeric: '{raw}'")))
}

impl LegacySession {
    fn migrate(self) -> Result<Session, StoreError> {
        let mut session = Session {
            started: self.game_started,
            ..Session::default()
        };

        for santa in self.santas.into_values() {
            let identity = parse_legacy_id(&santa.discord_id)?;
            session.participants.insert(
                identity,
                Participant {
                    identity,
                    display_name: santa.real_name,
                    shipping_address: santa.address,
                    notes: santa.notes,
                },
            );
        }

        for (giver, receiver) in self.selected_pairs {
            session
                .pairing
                .insert(parse_legacy_id(&giver)?, parse_legacy_id(&receiver)?);
        }

        for (giver, blocked) in self.blacklisted_pairs {
            let blocked = blocked
                .iter()
                .map(|id| parse_legacy_id(id))
                .collect::<Result<Vec<_>, _>>()?;
            session.exclusions.insert(parse_legacy_id(&giver)?, blocked);
        }

        session.primary_channel = match self.channel_id {
            Some(serde_json::Value::String(s)) => parse_legacy_id(&s)?,
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| StoreError::Invalid(format!("bad legacy channel id: {n}")))?,
            _ => 0,
        };

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: Identity) -> Participant {
        Participant {
            identity: id,
            display_name: format!("User {id}"),
            shipping_address: format!("{id} Main St"),
            notes: String::new(),
        }
    }

    fn started_session() -> Session {
        let mut session = Session::new(-100, ExclusionSet::new());
        for id in [1, 2, 3] {
            session.participants.insert(id, participant(id));
        }
        session.pairing = PairingAssignment::from([(1, 2), (2, 3), (3, 1)]);
        session.started = true;
        session
    }

    #[test]
    fn test_json_keeps_all_fields() {
        let mut session = started_session();
        session.exclusions.insert(1, vec![3]);
        let json = session.to_json().unwrap();
        assert!(json.contains("\"version\": 1"));

        let loaded = Session::from_json(&json).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_lookups_absent_before_start() {
        let mut session = started_session();
        assert_eq!(session.receiver_of(1), Some(2));
        assert_eq!(session.giver_of(2), Some(1));

        session.started = false;
        assert_eq!(session.receiver_of(1), None);
        assert_eq!(session.giver_of(2), None);
    }

    #[test]
    fn test_clear_keeps_channel_and_blacklists() {
        let mut session = started_session();
        session.exclusions.insert(1, vec![3]);
        session.clear();

        assert!(session.participants.is_empty());
        assert!(session.pairing.is_empty());
        assert!(!session.started);
        assert_eq!(session.primary_channel, -100);
        assert_eq!(session.exclusions.get(&1), Some(&vec![3]));
    }

    #[test]
    fn test_validate_rejects_fixed_point() {
        let mut session = started_session();
        session.pairing = PairingAssignment::from([(1, 1), (2, 3), (3, 2)]);
        assert!(session.validate().unwrap_err().contains("themself"));
    }

    #[test]
    fn test_validate_rejects_blacklisted_edge() {
        let mut session = started_session();
        session.exclusions.insert(1, vec![2]);
        assert!(session.validate().unwrap_err().contains("blacklisted"));
    }

    #[test]
    fn test_validate_rejects_pairing_without_start() {
        let mut session = started_session();
        session.started = false;
        assert!(session.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_partial_permutation() {
        let mut session = started_session();
        session.pairing.remove(&3);
        assert!(session.validate().is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = Session::from_json(r#"{"version": 7, "participants": {}}"#).unwrap_err();
        assert_eq!(err, StoreError::UnsupportedVersion(7));

        // Past u32::MAX the reported version stays intact.
        let err = Session::from_json(r#"{"version": 4294967297}"#).unwrap_err();
        assert_eq!(err, StoreError::UnsupportedVersion(4_294_967_297));
    }

    #[test]
    fn test_corrupt_pairing_rejected_on_load() {
        let json = r#"{
            "version": 1,
            "participants": {},
            "pairing": {"1": 2},
            "started": true
        }"#;
        assert!(matches!(Session::from_json(json), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_migrates_legacy_blob() {
        let json = r#"{
            "santas": {
                "11": {"discordId": "11", "realName": "Ann", "address": "1 A St", "notes": "no socks"},
                "22": {"discordId": "22", "name": "Ben", "address": "2 B St", "notes": ""},
                "33": {"discordId": "33", "realName": "Cat", "address": "3 C St", "notes": "tea"}
            },
            "selectedPairs": {},
            "gameStarted": false,
            "channelId": "1168246929503813652",
            "blacklistedPairs": {"11": ["22"]}
        }"#;

        let session = Session::from_json(json).unwrap();
        assert_eq!(session.participants.len(), 3);
        assert_eq!(session.participants[&11].display_name, "Ann");
        assert_eq!(session.participants[&22].display_name, "Ben");
        assert_eq!(session.participants[&33].notes, "tea");
        assert_eq!(session.primary_channel, 1168246929503813652);
        assert!(session.is_excluded(11, 22));
        assert!(!session.is_excluded(22, 11));
        assert!(!session.started);
    }

    #[test]
    fn test_migrates_started_legacy_blob() {
        let json = r#"{
            "santas": {
                "1": {"discordId": "1", "realName": "A", "address": "", "notes": ""},
                "2": {"discordId": "2", "realName": "B", "address": "", "notes": ""},
                "3": {"discordId": "3", "realName": "C", "address": "", "notes": ""}
            },
            "selectedPairs": {"1": "3", "3": "2", "2": "1"},
            "gameStarted": true
        }"#;

        let session = Session::from_json(json).unwrap();
        assert!(session.started);
        assert_eq!(session.receiver_of(1), Some(3));
        assert_eq!(session.giver_of(1), Some(2));
    }

    #[test]
    fn test_legacy_non_numeric_id_rejected() {
        let json = r#"{"santas": {"x": {"discordId": "abc", "realName": "A"}}}"#;
        assert!(matches!(Session::from_json(json), Err(StoreError::Invalid(_))));
    }
}
