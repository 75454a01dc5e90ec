//! Display queue: bounded ring of verified messages waiting to be rendered.

use std::collections::VecDeque;

use crate::protocol::MessageType;

pub const DISPLAY_CAPACITY: usize = 50;

/// One renderable chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub channel: u8,
    pub msg_type: MessageType,
    /// Unix seconds: the wire timestamp for received lines, the host clock otherwise.
    pub timestamp: u64,
    pub content: String,
    /// Local echo of something this device sent.
    pub own: bool,
}

#[derive(Debug)]
pub struct DisplayQueue {
    messages: VecDeque<DisplayMessage>,
    capacity: usize,
}

impl Default for DisplayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayQueue {
    pub fn new() -> Self {
        Self::with_capacity(DISPLAY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry once full. Returns the evicted message.
    pub fn push(&mut self, message: DisplayMessage) -> Option<DisplayMessage> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    /// `index`-th oldest message.
    pub fn get(&self, index: usize) -> Option<&DisplayMessage> {
        self.messages.get(index)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplayMessage> {
        self.messages.iter()
    }
}
