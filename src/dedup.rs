use std::collections::BTreeSet;

/// Remembers the most recently accepted sequence numbers of one peer so that
///  retransmitted data packets are not delivered twice.
///
/// The window is bounded: once more than `window` sequence numbers have been
///  seen, anything at or below `highest - window` is treated as a duplicate even
///  if it was never accepted. The window therefore has to be sized well above
///  the number of packets a peer can have in flight within its retry horizon.
pub struct DuplicateFilter {
    window: u64,
    highest: Option<u64>,
    seen: BTreeSet<u64>,
}

impl DuplicateFilter {
    pub fn new(window: usize) -> DuplicateFilter {
        DuplicateFilter {
            window: window as u64,
            highest: None,
            seen: BTreeSet::new(),
        }
    }

    /// Returns true if the sequence number was already accepted (or is too old to
    ///  tell); otherwise records it as accepted and returns false.
    pub fn check_and_insert(&mut self, sequence_number: u64) -> bool {
        if let Some(highest) = self.highest {
            if highest >= self.window && sequence_number <= highest - self.window {
                return true;
            }
        }
        if self.seen.contains(&sequence_number) {
            return true;
        }

        self.seen.insert(sequence_number);
        let highest = self.highest.map_or(sequence_number, |h| h.max(sequence_number));
        self.highest = Some(highest);

        if highest >= self.window {
            let lower_bound = highest - self.window;
            while let Some(&oldest) = self.seen.first() {
                if oldest > lower_bound {
                    break;
                }
                self.seen.remove(&oldest);
            }
        }
        false
    }
}
