use std::collections::{HashMap, HashSet};

use taskdeck_protocol::{Message, MessageId, PartId};

use crate::fingerprint::fingerprint;

/// Message and part ids observed for one session, plus the last fingerprint
/// recorded per updatable part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenState {
    message_ids: HashSet<MessageId>,
    part_ids: HashSet<PartId>,
    fingerprints: HashMap<PartId, String>,
}

impl SeenState {
    /// Marks every part of `history` as already observed.
    pub fn seeded(history: &[Message]) -> Self {
        let mut seen = Self::default();
        seen.seed(history);
        seen
    }

    pub fn seed(&mut self, history: &[Message]) {
        for message in history {
            self.message_ids.insert(message.id.clone());
            for part in &message.parts {
                self.part_ids.insert(part.id.clone());
                if let Some(print) = fingerprint(part) {
                    self.fingerprints.insert(part.id.clone(), print);
                }
            }
        }
    }

    pub fn has_message(&self, message_id: &MessageId) -> bool {
        self.message_ids.contains(message_id)
    }

    pub fn has_part(&self, part_id: &PartId) -> bool {
        self.part_ids.contains(part_id)
    }

    pub fn fingerprint(&self, part_id: &PartId) -> Option<&str> {
        self.fingerprints.get(part_id).map(String::as_str)
    }

    pub(crate) fn mark_message(&mut self, message_id: &MessageId) {
        self.message_ids.insert(message_id.clone());
    }

    pub(crate) fn mark_part(&mut self, part_id: &PartId, print: Option<String>) {
        self.part_ids.insert(part_id.clone());
        if let Some(print) = print {
            self.fingerprints.insert(part_id.clone(), print);
        }
    }

    pub fn message_count(&self) -> usize {
        self.message_ids.len()
    }

    pub fn part_count(&self) -> usize {
        self.part_ids.len()
    }

    pub fn clear(&mut self) {
        self.message_ids.clear();
        self.part_ids.clear();
        self.fingerprints.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.part_ids.is_empty() && self.message_ids.is_empty()
    }
}
