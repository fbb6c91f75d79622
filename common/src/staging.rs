use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::hal::PeerTracker;

pub const CONFIG_PAYLOAD_CAPACITY: usize = 512;
pub const COMMAND_PAYLOAD_CAPACITY: usize = 32;

#[derive(Debug)]
struct SlotState<const N: usize> {
    pending: bool,
    payload: heapless::String<N>,
}

/// Latest-wins mailbox holding at most `N` bytes of text.
#[derive(Debug)]
pub struct StagingSlot<const N: usize> {
    state: Mutex<SlotState<N>>,
}

impl<const N: usize> Default for StagingSlot<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StagingSlot<N> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: false,
                payload: heapless::String::new(),
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn write(&self, payload: &str) -> bool {
        let mut state = self.lock();
        state.pending = false;
        state.payload.clear();

        let mut truncated = false;
        for ch in payload.chars() {
            if state.payload.push(ch).is_err() {
                truncated = true;
                break;
            }
        }

        state.pending = true;
        truncated
    }

    pub fn write_bytes(&self, data: &[u8]) -> bool {
        let window = &data[..data.len().min(N)];
        let text = match core::str::from_utf8(window) {
            Ok(text) => text,
            Err(err) => {
                // valid_up_to is always a char boundary
                core::str::from_utf8(&window[..err.valid_up_to()]).unwrap_or_default()
            }
        };
        let truncated = self.write(text);
        truncated || window.len() < data.len() || text.len() < window.len()
    }

    pub fn drain(&self) -> Option<heapless::String<N>> {
        let mut state = self.lock();
        if !state.pending {
            return None;
        }
        let payload = state.payload.clone();
        state.pending = false;
        Some(payload)
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<N>> {
        // pending is only raised after a full copy, so a poisoned slot is
        // still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
pub struct Inbox {
    pub config: StagingSlot<CONFIG_PAYLOAD_CAPACITY>,
    pub command: StagingSlot<COMMAND_PAYLOAD_CAPACITY>,
    pub peers: PeerTracker,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn drain_without_write_is_empty() {
        let slot: StagingSlot<16> = StagingSlot::new();
        assert!(slot.drain().is_none());
        assert!(!slot.is_pending());
    }

    #[test]
    fn second_drain_is_a_no_op() {
        let slot: StagingSlot<16> = StagingSlot::new();
        slot.write("auto");

        assert_eq!(slot.drain().as_deref(), Some("auto"));
        assert!(slot.drain().is_none());
    }

    #[test]
    fn latest_write_wins() {
        let slot: StagingSlot<16> = StagingSlot::new();
        slot.write("power:10");
        slot.write("power:90");

        assert_eq!(slot.drain().as_deref(), Some("power:90"));
        assert!(slot.drain().is_none());
    }

    #[test]
    fn oversized_write_is_truncated_to_capacity() {
        let slot: StagingSlot<8> = StagingSlot::new();
        assert!(slot.write("power:100-and-more"));
        assert_eq!(slot.drain().as_deref(), Some("power:10"));
    }

    #[test]
    fn truncation_never_splits_a_character() {
        let slot: StagingSlot<5> = StagingSlot::new();
        assert!(slot.write("abcd°C"));
        assert_eq!(slot.drain().as_deref(), Some("abcd"));
    }

    #[test]
    fn write_bytes_stops_at_invalid_utf8() {
        let slot: StagingSlot<16> = StagingSlot::new();
        assert!(slot.write_bytes(&[b'a', b'u', 0xFF, b't', b'o']));
        assert_eq!(slot.drain().as_deref(), Some("au"));

        assert!(!slot.write_bytes(b"auto"));
        assert_eq!(slot.drain().as_deref(), Some("auto"));
    }

    #[test]
    fn concurrent_writes_are_never_observed_half_copied() {
        let inbox = Arc::new(Inbox::new());
        let producer = {
            let inbox = inbox.clone();
            thread::spawn(move || {
                for i in 0..2_000_u32 {
                    let payload = if i % 2 == 0 { "power:11" } else { "auto-auto" };
                    inbox.command.write(payload);
                }
            })
        };

        let mut drained = 0;
        while !producer.is_finished() || inbox.command.is_pending() {
            if let Some(payload) = inbox.command.drain() {
                assert!(payload == "power:11" || payload == "auto-auto", "torn: {payload}");
                drained += 1;
            }
        }
        producer.join().unwrap();

        assert!(drained >= 1);
        assert!(inbox.command.drain().is_none());
    }
}
