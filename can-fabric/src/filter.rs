//! Inclusive identifier-window accept filters.

/// One accept window: frames on `channel` whose raw identifier falls inside
/// `start_id..=stop_id` pass. On the wire a rule list is terminated by a
/// sentinel rule with a negative channel; in memory only real rules are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptRule {
    pub channel: i32,
    pub start_id: u32,
    pub stop_id: u32,
}

impl AcceptRule {
    /// The terminator rule carried on the wire after the last real rule.
    pub const SENTINEL: AcceptRule = AcceptRule {
        channel: -1,
        start_id: 0,
        stop_id: 0,
    };

    pub fn is_sentinel(&self) -> bool {
        self.channel < 0
    }
}

/// An immutable rule list. Replacement swaps the whole list at once; there is
/// no in-place edit.
#[derive(Clone, Debug, Default)]
pub struct AcceptFilter {
    rules: Vec<AcceptRule>,
}

impl AcceptFilter {
    /// Build a filter from a rule slice, ignoring everything at and past the
    /// first sentinel.
    pub fn new(rules: &[AcceptRule]) -> Self {
        let real = rules
            .iter()
            .take_while(|rule| !rule.is_sentinel())
            .copied()
            .collect();
        Self { rules: real }
    }

    pub fn rules(&self) -> &[AcceptRule] {
        &self.rules
    }

    pub fn accepts(&self, channel: u8, id_raw: u32) -> bool {
        self.rules.iter().any(|rule| {
            rule.channel == channel as i32 && rule.start_id <= id_raw && id_raw <= rule.stop_id
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_inclusive() {
        let filter = AcceptFilter::new(&[AcceptRule {
            channel: 0,
            start_id: 0x100,
            stop_id: 0x1FF,
        }]);
        assert!(!filter.accepts(0, 0xFF));
        assert!(filter.accepts(0, 0x100));
        assert!(filter.accepts(0, 0x1FF));
        assert!(!filter.accepts(0, 0x200));
    }

    #[test]
    fn channel_must_match() {
        let filter = AcceptFilter::new(&[AcceptRule {
            channel: 1,
            start_id: 0,
            stop_id: u32::MAX,
        }]);
        assert!(filter.accepts(1, 0x42));
        assert!(!filter.accepts(0, 0x42));
    }

    #[test]
    fn sentinel_cuts_the_list() {
        let filter = AcceptFilter::new(&[
            AcceptRule {
                channel: 0,
                start_id: 1,
                stop_id: 2,
            },
            AcceptRule::SENTINEL,
            AcceptRule {
                channel: 0,
                start_id: 0,
                stop_id: u32::MAX,
            },
        ]);
        assert_eq!(filter.rules().len(), 1);
        assert!(!filter.accepts(0, 0x500));
    }

    #[test]
    fn empty_filter_accepts_nothing() {
        let filter = AcceptFilter::new(&[]);
        assert!(!filter.accepts(0, 0));
    }
}
