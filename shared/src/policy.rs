//! Per-topic consistency and delivery policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single policy option together with its new value.
///
/// `UniqueKey`, `Ephemeral`, `PerParticipant` and `WriteProtected` are
/// declared to the relay; `RateLimit` and `SendOnConnect` only shape local
/// behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOption {
    /// Field of the value that the relay keeps unique across keys
    UniqueKey(Option<String>),
    /// Entries are relayed but never stored upstream
    Ephemeral(bool),
    /// Keys are participant ids, retracted when the participant leaves
    PerParticipant(bool),
    /// Minimum interval between outbound flushes
    RateLimit(Option<Duration>),
    /// Local writes only land once echoed back by the relay
    WriteProtected(bool),
    /// The first participant seeds the relay with its local cache
    SendOnConnect(bool),
}

impl PolicyOption {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyOption::UniqueKey(_) => "unique",
            PolicyOption::Ephemeral(_) => "ephemeral",
            PolicyOption::PerParticipant(_) => "perParticipant",
            PolicyOption::RateLimit(_) => "rateLimit",
            PolicyOption::WriteProtected(_) => "writeProtected",
            PolicyOption::SendOnConnect(_) => "sendOnConnect",
        }
    }

    pub fn is_declared_upstream(&self) -> bool {
        matches!(
            self,
            PolicyOption::UniqueKey(_)
                | PolicyOption::Ephemeral(_)
                | PolicyOption::PerParticipant(_)
                | PolicyOption::WriteProtected(_)
        )
    }
}

/// Policy of one topic. Every option defaults to disabled.
///
/// Fields are only reachable through the builder methods at construction
/// time and through [`TopicPolicy::apply`] afterwards, so every change can
/// be observed by the owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPolicy {
    unique_key: Option<String>,
    ephemeral: bool,
    per_participant: bool,
    rate_limit: Option<Duration>,
    write_protected: bool,
    send_on_connect: bool,
}

impl TopicPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique_key(mut self, field: impl Into<String>) -> Self {
        self.unique_key = Some(field.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn per_participant(mut self) -> Self {
        self.per_participant = true;
        self
    }

    pub fn rate_limit(mut self, interval: Duration) -> Self {
        self.rate_limit = Some(interval);
        self
    }

    pub fn write_protected(mut self) -> Self {
        self.write_protected = true;
        self
    }

    pub fn send_on_connect(mut self) -> Self {
        self.send_on_connect = true;
        self
    }

    pub fn unique_field(&self) -> Option<&str> {
        self.unique_key.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_per_participant(&self) -> bool {
        self.per_participant
    }

    pub fn rate_limit_interval(&self) -> Option<Duration> {
        self.rate_limit
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn sends_on_connect(&self) -> bool {
        self.send_on_connect
    }

    /// Applies an option, returning true if the policy changed
    pub fn apply(&mut self, option: &PolicyOption) -> bool {
        match option {
            PolicyOption::UniqueKey(field) => replace(&mut self.unique_key, field.clone()),
            PolicyOption::Ephemeral(value) => replace(&mut self.ephemeral, *value),
            PolicyOption::PerParticipant(value) => replace(&mut self.per_participant, *value),
            PolicyOption::RateLimit(value) => replace(&mut self.rate_limit, *value),
            PolicyOption::WriteProtected(value) => replace(&mut self.write_protected, *value),
            PolicyOption::SendOnConnect(value) => replace(&mut self.send_on_connect, *value),
        }
    }

    /// Options the first participant declares to the relay when seeding a
    /// fresh game, in declaration order
    pub fn declarations(&self) -> Vec<PolicyOption> {
        let mut options = Vec::new();
        if let Some(field) = &self.unique_key {
            options.push(PolicyOption::UniqueKey(Some(field.clone())));
        }
        if self.write_protected {
            options.push(PolicyOption::WriteProtected(true));
        }
        if self.ephemeral {
            options.push(PolicyOption::Ephemeral(true));
        }
        if self.per_participant {
            options.push(PolicyOption::PerParticipant(true));
        }
        options
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_disabled() {
        let policy = TopicPolicy::new();
        assert_eq!(policy.unique_field(), None);
        assert!(!policy.is_ephemeral());
        assert!(!policy.is_per_participant());
        assert_eq!(policy.rate_limit_interval(), None);
        assert!(!policy.is_write_protected());
        assert!(!policy.sends_on_connect());
    }

    #[test]
    fn test_builder() {
        let policy = TopicPolicy::new()
            .unique_key("seat")
            .per_participant()
            .rate_limit(Duration::from_millis(100));

        assert_eq!(policy.unique_field(), Some("seat"));
        assert!(policy.is_per_participant());
        assert_eq!(policy.rate_limit_interval(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_apply_reports_change() {
        let mut policy = TopicPolicy::new();

        assert!(policy.apply(&PolicyOption::WriteProtected(true)));
        assert!(policy.is_write_protected());

        assert!(!policy.apply(&PolicyOption::WriteProtected(true)));
        assert!(policy.apply(&PolicyOption::WriteProtected(false)));
        assert!(!policy.is_write_protected());
    }

    #[test]
    fn test_apply_unique_key() {
        let mut policy = TopicPolicy::new().unique_key("slotName");

        assert!(!policy.apply(&PolicyOption::UniqueKey(Some("slotName".to_string()))));
        assert!(policy.apply(&PolicyOption::UniqueKey(None)));
        assert_eq!(policy.unique_field(), None);
    }

    #[test]
    fn test_declarations_order() {
        let policy = TopicPolicy::new()
            .per_participant()
            .ephemeral()
            .write_protected()
            .unique_key("seat")
            .send_on_connect()
            .rate_limit(Duration::from_millis(50));

        assert_eq!(
            policy.declarations(),
            vec![
                PolicyOption::UniqueKey(Some("seat".to_string())),
                PolicyOption::WriteProtected(true),
                PolicyOption::Ephemeral(true),
                PolicyOption::PerParticipant(true),
            ]
        );
    }

    #[test]
    fn test_declared_upstream() {
        assert!(PolicyOption::WriteProtected(true).is_declared_upstream());
        assert!(PolicyOption::UniqueKey(None).is_declared_upstream());
        assert!(!PolicyOption::RateLimit(None).is_declared_upstream());
        assert!(!PolicyOption::SendOnConnect(true).is_declared_upstream());
    }
}
