use std::time::Duration;

use relay_core::SchedulingPolicy;

use crate::types::IterationValue;

/// Compute the value a claim writes back into the iteration field.
///
/// * `Regular`: `base + target_interval`, however late the claim is, so
///   cadence never drifts.
/// * `Irregular`: the queue minus its earliest tick.
/// * `IrregularSkipMissed`: the queue minus every tick `<= throttle`, so a
///   backlog of missed ticks collapses into this one claim.
///
/// A queue policy claiming an absent field leaves an empty queue behind; the
/// business side refills it with [`crate::WorkClaimStore::schedule_ticks`].
pub fn reschedule(
    policy: SchedulingPolicy,
    current: &IterationValue,
    base: i64,
    throttle: i64,
    target_interval: Duration,
) -> IterationValue {
    match policy {
        SchedulingPolicy::Regular => IterationValue::At(base + millis(target_interval)),
        SchedulingPolicy::Irregular => {
            let mut ticks = queue_of(current);
            if !ticks.is_empty() {
                ticks.remove(0);
            }
            IterationValue::Queue(ticks)
        }
        SchedulingPolicy::IrregularSkipMissed => {
            let mut ticks = queue_of(current);
            ticks.retain(|t| *t > throttle);
            IterationValue::Queue(ticks)
        }
    }
}

/// Initial value written for a NULL field when redistribution is on.
pub fn first_due(policy: SchedulingPolicy, at: i64) -> IterationValue {
    match policy {
        SchedulingPolicy::Regular => IterationValue::At(at),
        SchedulingPolicy::Irregular | SchedulingPolicy::IrregularSkipMissed => {
            IterationValue::Queue(vec![at])
        }
    }
}

/// Offset in `[0, interval)` derived from the entity id (FNV-1a).
///
/// Every process of the fleet computes the same offset for the same id.
pub fn spread_offset(id: &str, interval: Duration) -> i64 {
    let span = millis(interval);
    if span <= 0 {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % span as u64) as i64
}

fn queue_of(value: &IterationValue) -> Vec<i64> {
    match value {
        IterationValue::Queue(ticks) => {
            let mut ticks = ticks.clone();
            ticks.sort_unstable();
            ticks
        }
        IterationValue::At(t) => vec![*t],
        IterationValue::Absent => Vec::new(),
    }
}

pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
