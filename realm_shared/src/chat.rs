//! World chat.
//!
//! Each world keeps a bounded log of recent lines. Messages longer than
//! `MAX_MESSAGE_LENGTH` bytes are cut at the nearest char boundary.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Maximum message length in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// One logged chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub from: UserId,
    pub message: String,
}

impl ChatEntry {
    pub fn new(from: UserId, message: &str) -> Self {
        ChatEntry {
            from,
            message: truncate_message(message),
        }
    }
}

/// Cuts `message` to at most `MAX_MESSAGE_LENGTH` bytes.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LENGTH {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LENGTH;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Bounded chat history, oldest first.
#[derive(Debug, Clone)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    capacity: usize,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        ChatLog {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest once full. Returns the stored entry.
    pub fn push(&mut self, entry: ChatEntry) -> &ChatEntry {
        if self.capacity > 0 && self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.back()
    }
}
