//! Batched-issue mode.
//!
//! While enqueue mode is active, compute calls return once host-side issue
//! completes; no queue is finished and no benchmark scope closes. The exit
//! transition drains every used compute queue on every device and closes
//! the benchmark scope of the last used compute-id. Pinned host arrays stay
//! pinned until that barrier.

use super::registry::PinScope;

/// Caller-selected enqueue-mode behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Spread successive compute calls round-robin over the compute queues.
    /// Valid for single-device or intra-device pipelining only.
    pub async_queues: bool,
    /// Append a counting marker after every compute call so outstanding
    /// work can be observed via the marker counters.
    pub fine_grained: bool,
}

/// Dispatcher-internal mode state.
#[derive(Debug, Default)]
pub(crate) struct EnqueueState {
    options: Option<EnqueueOptions>,
    issue_index: u64,
    parked_pins: Vec<PinScope>,
}

impl EnqueueState {
    pub fn activate(&mut self, options: EnqueueOptions) -> bool {
        if self.options.is_some() {
            return false;
        }
        self.options = Some(options);
        self.issue_index = 0;
        true
    }

    pub fn deactivate(&mut self) -> Option<EnqueueOptions> {
        self.parked_pins.clear();
        self.options.take()
    }

    pub fn options(&self) -> Option<EnqueueOptions> {
        self.options
    }

    pub fn is_active(&self) -> bool {
        self.options.is_some()
    }

    /// Sequence number of the next batched issue, for queue round-robin.
    pub fn next_issue(&mut self) -> u64 {
        let n = self.issue_index;
        self.issue_index += 1;
        n
    }

    /// Park a pin scope until the drain barrier.
    pub fn park_pins(&mut self, pins: PinScope) {
        self.parked_pins.push(pins);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_cycle() {
        let mut state = EnqueueState::default();
        assert!(!state.is_active());

        assert!(state.activate(EnqueueOptions {
            async_queues: true,
            fine_grained: true,
        }));
        assert!(state.is_active());
        // double-enter is refused
        assert!(!state.activate(EnqueueOptions::default()));

        let opts = state.deactivate().unwrap();
        assert!(opts.async_queues);
        assert!(!state.is_active());
        assert!(state.deactivate().is_none());
    }

    #[test]
    fn test_issue_sequence_resets_per_session() {
        let mut state = EnqueueState::default();
        state.activate(EnqueueOptions::default());
        assert_eq!(state.next_issue(), 0);
        assert_eq!(state.next_issue(), 1);
        state.deactivate();

        state.activate(EnqueueOptions::default());
        assert_eq!(state.next_issue(), 0);
    }

    #[test]
    fn test_parked_pins_release_on_deactivate() {
        use crate::array::{AccessPolicy, ArraySpec, ElemKind, HostArray};
        use std::sync::Arc;

        let a = HostArray::zeroed(ElemKind::F32, 4);
        let specs = vec![ArraySpec::new(Arc::clone(&a), AccessPolicy::Read, 1)];

        let mut state = EnqueueState::default();
        state.activate(EnqueueOptions::default());
        state.park_pins(PinScope::new(&specs));
        assert!(a.is_pinned());

        state.deactivate();
        assert!(!a.is_pinned());
    }
}
