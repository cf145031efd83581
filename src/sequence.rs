// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contiguous-prefix checkpoint tracking.
//!
//! Items enter in feed order and may complete in any order. The checkpoint
//! is the sequence of the last item in the longest prefix where every item
//! completed. A failed item stays at the head forever, so nothing after it
//! is ever checkpointed in this session; the next session re-reads from
//! just before it.
//!
//! ```text
//! added:     s1   s2   s3   s4
//! state:     ok   ok   ERR  ok
//! checkpoint ───────^
//! ```

use std::collections::BTreeMap;

/// Handle for one tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Slot<S> {
    sequence: S,
    state: SlotState,
}

/// Tracks in-flight items and computes the safe checkpoint.
#[derive(Debug)]
pub struct SequenceTracker<S> {
    next_token: u64,
    slots: BTreeMap<u64, Slot<S>>,
    checkpoint: Option<S>,
    failed: usize,
}

impl<S: Clone> SequenceTracker<S> {
    /// Start tracking after `checkpoint` (the last fully-processed sequence).
    pub fn new(checkpoint: Option<S>) -> Self {
        Self {
            next_token: 0,
            slots: BTreeMap::new(),
            checkpoint,
            failed: 0,
        }
    }

    /// Register the next item in feed order.
    pub fn add(&mut self, sequence: S) -> SequenceToken {
        let token = self.next_token;
        self.next_token += 1;
        self.slots.insert(
            token,
            Slot {
                sequence,
                state: SlotState::Pending,
            },
        );
        SequenceToken(token)
    }

    /// Mark an item done. Returns the new checkpoint if it advanced.
    pub fn complete(&mut self, token: SequenceToken) -> Option<S> {
        if let Some(slot) = self.slots.get_mut(&token.0) {
            if slot.state == SlotState::Pending {
                slot.state = SlotState::Completed;
            }
        }
        self.advance()
    }

    /// Mark an item failed. It blocks the checkpoint from here on.
    pub fn fail(&mut self, token: SequenceToken) {
        if let Some(slot) = self.slots.get_mut(&token.0) {
            if slot.state == SlotState::Pending {
                slot.state = SlotState::Failed;
                self.failed += 1;
            }
        }
    }

    fn advance(&mut self) -> Option<S> {
        let mut advanced = None;
        while let Some(entry) = self.slots.first_entry() {
            if entry.get().state != SlotState::Completed {
                break;
            }
            advanced = Some(entry.remove().sequence);
        }
        if let Some(seq) = &advanced {
            self.checkpoint = Some(seq.clone());
        }
        advanced
    }

    /// Last sequence safe to persist.
    pub fn checkpoint(&self) -> Option<S> {
        self.checkpoint.clone()
    }

    /// Items added but not yet retired into the checkpoint (failed ones included).
    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of items marked failed.
    pub fn failed_count(&self) -> usize {
        self.failed
    }

    /// True when a failure is holding the checkpoint back.
    pub fn is_blocked(&self) -> bool {
        self.slots
            .values()
            .next()
            .is_some_and(|s| s.state == SlotState::Failed)
    }
}
