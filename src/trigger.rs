//! Timed triggers: the recovery mechanism behind retransmission and gap
//! filling.
//!
//! A trigger is a slot number with an absolute deadline. The driver keeps
//! two heaps of them — fills and ticks — and on every ticker event
//! materializes the due ones into packets built from a fixed template, so
//! a stalled slot always has a bounded-delay nudge coming.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::time::Instant;

use tracing::debug;

use crate::message::{Envelope, Msg};

/// A scheduled action against slot `n`, due at absolute time `t` in
/// nanoseconds on the process-local monotonic clock. Ordered so the
/// earliest deadline sorts first in a `BinaryHeap`.
#[derive(Debug, Clone, Copy)]
pub struct Trigger {
    pub t: i64,
    pub n: u64,
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Trigger) -> bool {
        self.t == other.t
    }
}

impl Eq for Trigger {}

impl PartialOrd for Trigger {
    fn partial_cmp(&self, other: &Trigger) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Trigger {
    fn cmp(&self, other: &Trigger) -> Ordering {
        other.t.cmp(&self.t)
    }
}

/// Nanoseconds elapsed since the process-local clock epoch.
pub fn nanotime() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

/// Schedule a trigger against slot `n`, `delay` nanoseconds from `now`.
pub fn sched_trigger(heap: &mut BinaryHeap<Trigger>, n: u64, now: i64, delay: i64) {
    heap.push(Trigger { t: now + delay, n });
}

/// Materialize every trigger due by `now` into a packet built from
/// `template` with the trigger's slot number filled in, pushing each onto
/// the packet heap. Triggers fire in non-decreasing deadline order.
/// Returns how many fired.
pub fn apply_triggers(
    packets: &mut BinaryHeap<Envelope>,
    triggers: &mut BinaryHeap<Trigger>,
    now: i64,
    template: &Msg,
) -> usize {
    let mut fired = 0;
    while let Some(head) = triggers.peek().copied() {
        if head.t > now {
            break;
        }
        triggers.pop();

        let mut msg = template.clone();
        msg.seqn = Some(head.n);
        debug!(seqn = head.n, cmd = ?msg.command(), "trigger fired");
        packets.push(Envelope::new("", msg));
        fired += 1;
    }
    fired
}
