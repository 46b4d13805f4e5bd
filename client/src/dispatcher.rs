//! Fan-out of inbound batches and lifecycle events to topic engines

use crate::topic::TopicSink;
use log::{debug, trace};
use shared::{Entry, SessionInfo};
use std::collections::HashMap;
use std::rc::Rc;

/// Routes entries to the engine registered under their topic name.
///
/// Engines are kept in registration order, which is also the order in which
/// they observe connects, disconnects and multi-topic batches.
#[derive(Default)]
pub struct Dispatcher {
    topics: Vec<Rc<dyn TopicSink>>,
    index: HashMap<String, usize>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine. A second engine with the same name replaces the
    /// first one in place.
    pub fn register(&mut self, topic: Rc<dyn TopicSink>) {
        let name = topic.name().to_string();
        match self.index.get(&name) {
            Some(&slot) => {
                debug!("Replacing engine for topic {}", name);
                self.topics[slot] = topic;
            }
            None => {
                self.index.insert(name, self.topics.len());
                self.topics.push(topic);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Registered engines, in registration order
    pub fn topics(&self) -> Vec<Rc<dyn TopicSink>> {
        self.topics.clone()
    }

    /// Splits a batch into per-topic groups, keeping the relative order of
    /// entries within each group. Entries for unknown topics are dropped.
    /// A full snapshot yields a (possibly empty) group for every engine.
    pub fn route(&self, entries: Vec<Entry>, full: bool) -> Vec<(Rc<dyn TopicSink>, Vec<Entry>)> {
        let mut groups: Vec<Vec<Entry>> = vec![Vec::new(); self.topics.len()];
        let mut touched = vec![full; self.topics.len()];

        for entry in entries {
            match self.index.get(entry.topic()) {
                Some(&slot) => {
                    touched[slot] = true;
                    groups[slot].push(entry);
                }
                None => trace!("Dropping entry for unknown topic {}", entry.topic()),
            }
        }

        self.topics
            .iter()
            .zip(groups)
            .zip(touched)
            .filter(|(_, touched)| *touched)
            .map(|((topic, group), _)| (Rc::clone(topic), group))
            .collect()
    }

    pub fn dispatch(&self, entries: Vec<Entry>, full: bool) {
        for (topic, group) in self.route(entries, full) {
            topic.receive(&group, full);
        }
    }

    pub fn connect(&self, session: &SessionInfo, is_first: bool) {
        for topic in &self.topics {
            topic.on_connect(session, is_first);
        }
    }

    pub fn disconnect(&self, session: Option<&SessionInfo>) {
        for topic in &self.topics {
            topic.on_disconnect(session);
        }
    }
}
