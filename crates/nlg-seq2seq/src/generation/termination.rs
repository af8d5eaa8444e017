//! Per-sequence finished tracking.

/// Decoding state of one sequence in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Running,
    /// EOS was emitted; `length` counts every token up to and including it.
    Finished { length: usize },
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, SequenceStatus::Finished { .. })
    }
}

/// Tracks which sequences emitted EOS and when the loop may stop.
#[derive(Debug, Clone)]
pub struct TerminationTracker {
    statuses: Vec<SequenceStatus>,
    eos_token_id: Option<u32>,
    /// Written in place of the sampled token once a sequence is finished.
    fill_token_id: Option<u32>,
    max_length: usize,
}

impl TerminationTracker {
    /// Without an `eos_token_id` no sequence ever finishes early. Finished
    /// sequences are filled with `pad_token_id`, or with EOS itself when no pad
    /// id exists.
    pub fn new(
        batch_size: usize,
        eos_token_id: Option<u32>,
        pad_token_id: Option<u32>,
        max_length: usize,
    ) -> Self {
        Self {
            statuses: vec![SequenceStatus::Running; batch_size],
            eos_token_id,
            fill_token_id: pad_token_id.or(eos_token_id),
            max_length,
        }
    }

    pub fn statuses(&self) -> &[SequenceStatus] {
        &self.statuses
    }

    pub fn num_finished(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_finished()).count()
    }

    pub fn all_finished(&self) -> bool {
        self.statuses.iter().all(SequenceStatus::is_finished)
    }

    /// Replaces the picks of already finished sequences with the fill token.
    pub fn mask_finished(&self, next_tokens: &mut [u32]) {
        let Some(fill) = self.fill_token_id else {
            return;
        };
        for (token, status) in next_tokens.iter_mut().zip(&self.statuses) {
            if status.is_finished() {
                *token = fill;
            }
        }
    }

    /// Records the tokens appended at this step; `new_len` is the sequence
    /// length after appending them.
    pub fn update(&mut self, appended: &[u32], new_len: usize) {
        let Some(eos) = self.eos_token_id else {
            return;
        };
        for (status, &token) in self.statuses.iter_mut().zip(appended) {
            if *status == SequenceStatus::Running && token == eos {
                *status = SequenceStatus::Finished { length: new_len };
            }
        }
    }

    /// True once every sequence finished or the length budget is spent.
    pub fn is_done(&self, cur_len: usize) -> bool {
        cur_len >= self.max_length || self.all_finished()
    }

    /// Final length of every sequence; running ones count as `cur_len`.
    pub fn lengths(&self, cur_len: usize) -> Vec<usize> {
        self.statuses
            .iter()
            .map(|status| match status {
                SequenceStatus::Finished { length } => *length,
                SequenceStatus::Running => cur_len,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finishes_on_first_eos_only() {
        let mut tracker = TerminationTracker::new(2, Some(2), Some(0), 10);
        tracker.update(&[2, 5], 2);
        assert_eq!(tracker.statuses()[0], SequenceStatus::Finished { length: 2 });
        assert_eq!(tracker.statuses()[1], SequenceStatus::Running);

        // A later EOS does not move the recorded length.
        tracker.update(&[2, 2], 3);
        assert_eq!(tracker.statuses()[0], SequenceStatus::Finished { length: 2 });
        assert_eq!(tracker.statuses()[1], SequenceStatus::Finished { length: 3 });
        assert!(tracker.all_finished());
        assert!(tracker.is_done(3));
    }

    #[test]
    fn test_mask_finished_uses_pad() {
        let mut tracker = TerminationTracker::new(3, Some(2), Some(0), 10);
        tracker.update(&[7, 2, 7], 2);
        let mut next = vec![4, 4, 4];
        tracker.mask_finished(&mut next);
        assert_eq!(next, vec![4, 0, 4]);
    }

    #[test]
    fn test_mask_finished_falls_back_to_eos() {
        let mut tracker = TerminationTracker::new(2, Some(2), None, 10);
        tracker.update(&[2, 9], 2);
        let mut next = vec![9, 9];
        tracker.mask_finished(&mut next);
        assert_eq!(next, vec![2, 9]);
    }

    #[test]
    fn test_without_eos_nothing_finishes() {
        let mut tracker = TerminationTracker::new(2, None, Some(0), 4);
        tracker.update(&[0, 1], 2);
        assert_eq!(tracker.num_finished(), 0);
        assert!(!tracker.is_done(3));
        assert!(tracker.is_done(4));
    }

    #[test]
    fn test_lengths() {
        let mut tracker = TerminationTracker::new(3, Some(2), Some(0), 6);
        tracker.update(&[5, 2, 5], 2);
        tracker.update(&[2, 0, 5], 3);
        assert_eq!(tracker.lengths(6), vec![3, 2, 6]);
    }
}
