//! Priority scoring shared by the queue store and the urgent-interrupt path.
//!
//! A score packs three keys into one `u128`, most significant first:
//! the urgent flag, the priority tier, and the inverted enqueue time. Higher
//! scores are popped first, so an urgent `Low` message outranks a non-urgent
//! `Critical` one, and an earlier message outranks a later one of the same
//! class. Exact ties are left to the store's insertion sequence.

use chrono::{DateTime, Utc};

use crate::models::MessagePriority;

pub type Score = u128;

const URGENT_SHIFT: u32 = 72;
const TIER_SHIFT: u32 = 64;

pub fn score(priority: MessagePriority, urgent: bool, enqueued_at: DateTime<Utc>) -> Score {
    let boost = u128::from(urgent) << URGENT_SHIFT;
    let tier = u128::from(priority.rank()) << TIER_SHIFT;
    // Pre-epoch timestamps clamp to zero.
    let micros = u64::try_from(enqueued_at.timestamp_micros()).unwrap_or(0);
    let freshness = u128::from(u64::MAX - micros);
    boost | tier | freshness
}

/// Messages allowed to jump ahead of already-dispatched work in urgent mode.
pub fn is_interrupting(priority: MessagePriority, urgent: bool) -> bool {
    urgent || priority >= MessagePriority::Urgent
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn higher_priority_scores_higher() {
        let t = at(0);
        for pair in MessagePriority::ALL.windows(2) {
            assert!(score(pair[1], false, t) > score(pair[0], false, t));
        }
    }

    #[test]
    fn priority_beats_enqueue_time() {
        let early_low = score(MessagePriority::Low, false, at(0));
        let late_high = score(MessagePriority::High, false, at(10_000));
        assert!(late_high > early_low);
    }

    #[test]
    fn urgent_flag_outranks_every_tier() {
        let urgent_low = score(MessagePriority::Low, true, at(100));
        let critical = score(MessagePriority::Critical, false, at(0));
        assert!(urgent_low > critical);
    }

    #[test]
    fn earlier_enqueue_wins_within_same_class() {
        assert!(score(MessagePriority::Normal, false, at(1)) > score(MessagePriority::Normal, false, at(2)));
        assert!(score(MessagePriority::Low, true, at(1)) > score(MessagePriority::Low, true, at(2)));
    }

    #[test]
    fn pre_epoch_timestamps_do_not_panic() {
        let ancient = Utc.timestamp_opt(-5, 0).unwrap();
        let s = score(MessagePriority::Normal, false, ancient);
        assert!(s > score(MessagePriority::Normal, false, at(0)));
    }

    #[test]
    fn interrupting_classes() {
        assert!(is_interrupting(MessagePriority::Critical, false));
        assert!(is_interrupting(MessagePriority::Urgent, false));
        assert!(is_interrupting(MessagePriority::Low, true));
        assert!(!is_interrupting(MessagePriority::High, false));
    }
}
