//! Per-session conversation history

use std::collections::VecDeque;

use crate::dialogue::Exchange;

/// Bounded FIFO of recent exchanges; the oldest is evicted first
#[derive(Debug)]
pub struct ConversationContext {
    capacity: usize,
    exchanges: VecDeque<Exchange>,
}

impl ConversationContext {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            exchanges: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an exchange, evicting the oldest when full
    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        if self.exchanges.len() == self.capacity {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(Exchange {
            user: user.into(),
            assistant: assistant.into(),
        });
    }

    /// Exchanges in chronological order
    pub fn history(&mut self) -> &[Exchange] {
        self.exchanges.make_contiguous()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn clear(&mut self) {
        self.exchanges = VecDeque::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_evicted_first() {
        let mut context = ConversationContext::new(2);
        context.push("a", "1");
        context.push("b", "2");
        context.push("c", "3");

        let users: Vec<_> = context.history().iter().map(|e| e.user.as_str()).collect();
        assert_eq!(users, ["b", "c"]);
        assert_eq!(context.len(), 2);
    }
}
