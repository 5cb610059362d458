//! Per-slot Paxos instance: acceptor, coordinator, and learner folded into
//! one [`Run`].
//!
//! A run never touches the network or a clock directly. The driver hands
//! it one decoded packet at a time; the run replies through the outbound
//! channel, schedules its own retransmission nudge on the tick heap, and
//! publishes exactly one [`Op`] the first time its learner reaches quorum.
//! After that it is `done` and the driver stops routing packets to it.
//!
//! Ballot layout: every coordinator starts at `index_of(self) + |cals|`
//! and climbs in steps of `|cals|`, so concurrent coordinators never share
//! a ballot and `crnd % |cals|` always names the coordinator that owns the
//! current round.

use std::collections::{BinaryHeap, HashMap, HashSet};

use crossbeam_channel::Sender;
use prost::Message as _;
use tracing::debug;

use crate::message::{Cmd, Envelope, Msg, Packet};
use crate::store::Op;
use crate::trigger::{sched_trigger, Trigger};

/// First retransmission delay in nanoseconds; doubles on every tick.
pub(crate) const INITIAL_WAIT_BOUND: i64 = 100_000_000;

#[derive(Default)]
struct Acceptor {
    /// Highest ballot promised.
    rnd: u64,
    /// Ballot of the accepted value, 0 when none.
    vrnd: u64,
    vval: Vec<u8>,
}

impl Acceptor {
    fn update(&mut self, m: &Msg) -> Option<Msg> {
        match m.command()? {
            Cmd::Invite => {
                let crnd = m.crnd?;
                if crnd <= self.rnd {
                    return None;
                }
                self.rnd = crnd;

                let mut out = Msg::new(Cmd::Rsvp);
                out.crnd = Some(crnd);
                out.vrnd = Some(self.vrnd);
                out.value = Some(self.vval.clone());
                Some(out)
            }
            Cmd::Nominate => {
                let crnd = m.crnd?;
                if crnd < self.rnd || crnd == self.vrnd {
                    return None;
                }
                self.rnd = crnd;
                self.vrnd = crnd;
                self.vval = m.value.clone().unwrap_or_default();

                let mut out = Msg::new(Cmd::Vote);
                out.crnd = Some(crnd);
                out.value = Some(self.vval.clone());
                Some(out)
            }
            _ => None,
        }
    }
}

struct Coordinator {
    size: usize,
    quorum: usize,
    crnd: u64,
    begun: bool,
    target: Vec<u8>,
    /// Distinct rsvp senders counted toward quorum this round.
    seen: HashSet<String>,
    gots: usize,
    /// Highest accepted ballot reported in an rsvp, with its value.
    vr: u64,
    vv: Vec<u8>,
}

impl Coordinator {
    fn new(size: usize, quorum: usize, crnd: u64) -> Coordinator {
        Coordinator {
            size,
            quorum,
            crnd,
            begun: false,
            target: Vec::new(),
            seen: HashSet::new(),
            gots: 0,
            vr: 0,
            vv: Vec::new(),
        }
    }

    /// Returns an outbound broadcast, if any, and whether a retransmission
    /// tick should be scheduled.
    fn update(&mut self, p: &Envelope) -> (Option<Msg>, bool) {
        if self.size < 1 {
            return (None, false);
        }
        match p.command() {
            Some(Cmd::Propose) => {
                if self.begun {
                    return (None, false);
                }
                self.begun = true;
                self.target = p.msg.value.clone().unwrap_or_default();

                let mut out = Msg::new(Cmd::Invite);
                out.crnd = Some(self.crnd);
                (Some(out), true)
            }
            Some(Cmd::Rsvp) => {
                if !self.begun || self.gots >= self.quorum {
                    return (None, false);
                }
                if p.msg.crnd != Some(self.crnd) {
                    return (None, false);
                }
                if !self.seen.insert(p.addr.clone()) {
                    return (None, false);
                }
                self.gots += 1;

                let vrnd = p.msg.vrnd.unwrap_or(0);
                if vrnd > self.vr {
                    self.vr = vrnd;
                    self.vv = p.msg.value.clone().unwrap_or_default();
                }
                if self.gots < self.quorum {
                    return (None, false);
                }

                // A value accepted in an earlier round wins over our own.
                let chosen = if self.vr > 0 {
                    self.vv.clone()
                } else {
                    self.target.clone()
                };
                let mut out = Msg::new(Cmd::Nominate);
                out.crnd = Some(self.crnd);
                out.value = Some(chosen);
                (Some(out), false)
            }
            Some(Cmd::Tick) => {
                if !self.begun {
                    return (None, false);
                }
                self.crnd += self.size as u64;
                self.seen.clear();
                self.gots = 0;
                self.vr = 0;
                self.vv.clear();

                let mut out = Msg::new(Cmd::Invite);
                out.crnd = Some(self.crnd);
                (Some(out), true)
            }
            _ => (None, false),
        }
    }
}

struct Learner {
    quorum: usize,
    /// Highest ballot with votes tallied so far.
    round: u64,
    votes: HashMap<Vec<u8>, usize>,
    voted: HashSet<String>,
    done: bool,
    value: Vec<u8>,
}

impl Learner {
    fn new(quorum: usize) -> Learner {
        Learner {
            quorum,
            round: 0,
            votes: HashMap::new(),
            voted: HashSet::new(),
            done: false,
            value: Vec::new(),
        }
    }

    /// Returns the decided value the first time this learner decides.
    fn update(&mut self, p: &Envelope) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        match p.command() {
            Some(Cmd::Learn) => {
                self.done = true;
                self.value = p.msg.value.clone().unwrap_or_default();
                Some(self.value.clone())
            }
            Some(Cmd::Vote) => {
                let crnd = p.msg.crnd.unwrap_or(0);
                if crnd < self.round {
                    return None;
                }
                if crnd > self.round {
                    self.round = crnd;
                    self.votes.clear();
                    self.voted.clear();
                }
                if !self.voted.insert(p.addr.clone()) {
                    return None;
                }

                let value = p.msg.value.clone().unwrap_or_default();
                let tally = self.votes.entry(value.clone()).or_insert(0);
                *tally += 1;
                if *tally < self.quorum {
                    return None;
                }
                self.done = true;
                self.value = value;
                Some(self.value.clone())
            }
            _ => None,
        }
    }
}

/// One live consensus run, identified by its slot number.
pub struct Run {
    pub seqn: u64,
    pub cals: Vec<String>,
    pub addrs: Vec<String>,
    out: Sender<Packet>,
    ops: Sender<Op>,
    bound: i64,
    proposed: bool,
    acceptor: Acceptor,
    coordinator: Coordinator,
    learner: Learner,
}

impl Run {
    pub fn new(
        seqn: u64,
        self_id: &str,
        cals: Vec<String>,
        addrs: Vec<String>,
        out: Sender<Packet>,
        ops: Sender<Op>,
    ) -> Run {
        let size = cals.len();
        let quorum = size / 2 + 1;
        let crnd = (position(&cals, self_id) + size as i64) as u64;
        Run {
            seqn,
            cals,
            addrs,
            out,
            ops,
            bound: INITIAL_WAIT_BOUND,
            proposed: false,
            acceptor: Acceptor::default(),
            coordinator: Coordinator::new(size, quorum, crnd),
            learner: Learner::new(quorum),
        }
    }

    /// Position of `id` within the coordinator set, or -1.
    pub fn index_of(&self, id: &str) -> i64 {
        position(&self.cals, id)
    }

    /// Majority of the coordinator set.
    pub fn quorum(&self) -> usize {
        self.cals.len() / 2 + 1
    }

    /// Whether `id` owns the coordinator round this run is currently on.
    pub fn is_leader(&self, id: &str) -> bool {
        match self.cals.iter().position(|cal| cal == id) {
            Some(i) => self.coordinator.crnd % self.cals.len() as u64 == i as u64,
            None => false,
        }
    }

    /// Terminal: the learner has decided and the op has been published.
    pub fn is_done(&self) -> bool {
        self.learner.done
    }

    /// Whether a proposal has reached this run's coordinator.
    pub fn has_proposal(&self) -> bool {
        self.proposed
    }

    /// Apply one packet. May emit outbound packets, schedule a tick on
    /// `ticks`, and publish the decided op exactly once.
    pub fn update(&mut self, p: &Envelope, ticks: &mut BinaryHeap<Trigger>, now: i64) {
        if p.command() == Some(Cmd::Tick) {
            self.bound *= 2;
        }
        if p.command() == Some(Cmd::Propose) {
            self.proposed = true;
        }

        let (m, wants_tick) = self.coordinator.update(p);
        if let Some(m) = m {
            self.broadcast(m);
        }
        if wants_tick {
            sched_trigger(ticks, self.seqn, now, self.bound);
        }

        if let Some(m) = self.acceptor.update(&p.msg) {
            match m.command() {
                // Promises go back to whoever invited; votes go to every
                // learner.
                Some(Cmd::Rsvp) => self.send_to(&p.addr, m),
                _ => self.broadcast(m),
            }
        }

        if let Some(value) = self.learner.update(p) {
            debug!(seqn = self.seqn, "learned value");
            let _ = self.ops.send(Op {
                seqn: self.seqn,
                mutation: value,
            });
        }
    }

    fn broadcast(&self, m: Msg) {
        for addr in &self.addrs {
            self.send_to(addr, m.clone());
        }
    }

    fn send_to(&self, addr: &str, mut m: Msg) {
        m.seqn = Some(self.seqn);
        let _ = self.out.send(Packet {
            addr: addr.to_string(),
            data: m.encode_to_vec(),
        });
    }
}

fn position(cals: &[String], id: &str) -> i64 {
    cals.iter()
        .position(|cal| cal == id)
        .map(|i| i as i64)
        .unwrap_or(-1)
}
