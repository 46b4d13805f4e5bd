//! Authoritative state of one game
//!
//! The relay keeps the last value of every non-ephemeral key together with
//! the policies participants declared. Batches are validated as a whole
//! before anything is committed, so a rejected batch leaves no trace.

use crate::utils::{credentials_match, random_id, CREDENTIAL_LENGTH, PLAYER_ID_LENGTH};
use log::{debug, info};
use serde_json::Value;
use shared::{DataEntry, Entry, Key, Payload, PolicyEntry, PolicyOption, TopicPolicy};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("topic {topic} is write-protected")]
    WriteProtected { topic: String },
    #[error("{field} of {topic}/{key} is already used by {holder}")]
    UniqueViolation {
        topic: String,
        field: String,
        key: Key,
        holder: Key,
    },
    #[error("value of {topic}/{key} is not valid JSON")]
    MalformedValue { topic: String, key: Key },
}

#[derive(Debug)]
pub struct Game {
    id: String,
    credential: String,
    players: BTreeSet<String>,
    topics: BTreeMap<String, BTreeMap<Key, Payload>>,
    policies: BTreeMap<String, TopicPolicy>,
}

impl Game {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_credential(id, random_id(CREDENTIAL_LENGTH))
    }

    pub fn with_credential(id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential: credential.into(),
            players: BTreeSet::new(),
            topics: BTreeMap::new(),
            policies: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn check_credential(&self, given: &str) -> bool {
        credentials_match(&self.credential, given)
    }

    /// Assigns a player id unique within this game
    pub fn add_player(&mut self) -> String {
        loop {
            let player_id = random_id(PLAYER_ID_LENGTH);
            if self.players.insert(player_id.clone()) {
                info!("Player {} joined game {}", player_id, self.id);
                return player_id;
            }
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn policy(&self, topic: &str) -> Option<&TopicPolicy> {
        self.policies.get(topic)
    }

    pub fn is_write_protected(&self, topic: &str) -> bool {
        self.policies
            .get(topic)
            .map_or(false, TopicPolicy::is_write_protected)
    }

    pub fn get(&self, topic: &str, key: &Key) -> Option<&Payload> {
        self.topics.get(topic).and_then(|entries| entries.get(key))
    }

    /// Validates and commits a batch sent by a participant.
    ///
    /// Writes to write-protected topics and changes of write protection
    /// require `authenticated`. Values of topics with a unique field must
    /// not share that field with another key of the topic. On error nothing
    /// is committed.
    pub fn apply(&mut self, entries: &[Entry], authenticated: bool) -> Result<(), GameError> {
        self.validate(entries, authenticated)?;

        for entry in entries {
            match entry {
                Entry::Policy(PolicyEntry { topic, option }) => {
                    let policy = self.policies.entry(topic.clone()).or_default();
                    if policy.apply(option) {
                        debug!("Game {}: {} set {:?}", self.id, topic, option);
                    }
                    if *option == PolicyOption::Ephemeral(true) {
                        self.topics.remove(topic);
                    }
                }
                Entry::Data(DataEntry { topic, key, value }) => {
                    if self.policies.get(topic).map_or(false, TopicPolicy::is_ephemeral) {
                        continue;
                    }
                    match value {
                        Some(value) => {
                            self.topics
                                .entry(topic.clone())
                                .or_default()
                                .insert(key.clone(), value.clone());
                        }
                        None => self.remove_key(topic, key),
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self, entries: &[Entry], authenticated: bool) -> Result<(), GameError> {
        // Policies and unique-topic contents as they would be mid-batch
        let mut policies: HashMap<&str, TopicPolicy> = HashMap::new();
        let mut staged: HashMap<&str, BTreeMap<Key, Payload>> = HashMap::new();

        for entry in entries {
            match entry {
                Entry::Policy(PolicyEntry { topic, option }) => {
                    if matches!(option, PolicyOption::WriteProtected(_)) && !authenticated {
                        return Err(GameError::WriteProtected {
                            topic: topic.clone(),
                        });
                    }
                    policies
                        .entry(topic.as_str())
                        .or_insert_with(|| self.policies.get(topic).cloned().unwrap_or_default())
                        .apply(option);
                }
                Entry::Data(DataEntry { topic, key, value }) => {
                    let policy = policies
                        .get(topic.as_str())
                        .or_else(|| self.policies.get(topic));
                    if policy.map_or(false, TopicPolicy::is_write_protected) && !authenticated {
                        return Err(GameError::WriteProtected {
                            topic: topic.clone(),
                        });
                    }
                    let Some(field) = policy.and_then(TopicPolicy::unique_field) else {
                        continue;
                    };

                    let view = staged
                        .entry(topic.as_str())
                        .or_insert_with(|| self.topics.get(topic).cloned().unwrap_or_default());
                    let Some(value) = value else {
                        view.remove(key);
                        continue;
                    };

                    let unique = unique_value(value, field).map_err(|_| GameError::MalformedValue {
                        topic: topic.clone(),
                        key: key.clone(),
                    })?;
                    if let Some(unique) = unique {
                        let holder = view.iter().find(|(other, payload)| {
                            *other != key
                                && unique_value(payload, field).ok().flatten().as_ref() == Some(&unique)
                        });
                        if let Some((holder, _)) = holder {
                            return Err(GameError::UniqueViolation {
                                topic: topic.clone(),
                                field: field.to_string(),
                                key: key.clone(),
                                holder: holder.clone(),
                            });
                        }
                    }
                    view.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Entries a joining participant receives as a full snapshot
    pub fn snapshot(&self) -> Vec<Entry> {
        let declarations = self
            .policies
            .iter()
            .filter(|(_, policy)| policy.is_write_protected())
            .map(|(topic, _)| Entry::policy(topic.clone(), PolicyOption::WriteProtected(true)));

        let data = self.topics.iter().flat_map(|(topic, entries)| {
            entries
                .iter()
                .map(move |(key, value)| Entry::data(topic.clone(), key.clone(), Some(value.clone())))
        });

        declarations.chain(data).collect()
    }

    /// Current values of everything `entries` touched, used to undo a
    /// rejected batch on the sender's side
    pub fn restore(&self, entries: &[Entry]) -> Vec<Entry> {
        let mut seen = HashSet::new();
        let mut restored = Vec::new();

        for entry in entries {
            match entry {
                Entry::Data(DataEntry { topic, key, .. }) => {
                    if seen.insert((topic.as_str(), Some(key))) {
                        restored.push(Entry::data(
                            topic.clone(),
                            key.clone(),
                            self.get(topic, key).cloned(),
                        ));
                    }
                }
                Entry::Policy(PolicyEntry {
                    topic,
                    option: PolicyOption::WriteProtected(_),
                }) => {
                    if seen.insert((topic.as_str(), None)) {
                        restored.push(Entry::policy(
                            topic.clone(),
                            PolicyOption::WriteProtected(self.is_write_protected(topic)),
                        ));
                    }
                }
                Entry::Policy(_) => {}
            }
        }
        restored
    }

    /// Removes a player and retracts its key from every per-participant
    /// topic. Returns the deletions to relay to the remaining players.
    pub fn remove_player(&mut self, player_id: &str) -> Vec<Entry> {
        if !self.players.remove(player_id) {
            return Vec::new();
        }
        info!("Player {} left game {}", player_id, self.id);

        let key = Key::from(player_id);
        let topics: Vec<String> = self
            .policies
            .iter()
            .filter(|(topic, policy)| policy.is_per_participant() && self.get(topic, &key).is_some())
            .map(|(topic, _)| topic.clone())
            .collect();

        topics
            .into_iter()
            .map(|topic| {
                self.remove_key(&topic, &key);
                Entry::data(topic, key.clone(), None)
            })
            .collect()
    }

    fn remove_key(&mut self, topic: &str, key: &Key) {
        if let Some(entries) = self.topics.get_mut(topic) {
            entries.remove(key);
            if entries.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

/// The unique field of a JSON value, or `None` if absent or null
fn unique_value(payload: &[u8], field: &str) -> Result<Option<Value>, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;
    Ok(value.get(field).filter(|v| !v.is_null()).cloned())
}
