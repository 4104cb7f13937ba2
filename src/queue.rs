#![expect(
    clippy::module_name_repetitions,
    reason = "Queue types include the module name to indicate their scope"
)]

use std::collections::VecDeque;

/// FIFO buffer of protocol lines awaiting an open connection.
///
/// Bounded: when full, the oldest pending line is dropped to make room,
/// so a long outage sheds stale backlog instead of growing without limit.
#[derive(Debug)]
pub struct OutboundQueue {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting the oldest pending line if at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            let dropped = self.lines.pop_front();
            tracing::warn!(
                capacity = self.capacity,
                ?dropped,
                "Outbound queue full, dropping oldest pending line"
            );
        }
        self.lines.push_back(line);
    }

    /// Snapshot and clear the pending lines, preserving order.
    ///
    /// Lines pushed after this call belong to the next flush.
    pub fn take_pending(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
