//! Consensus manager: the per-node driver that owns the pipeline of Paxos
//! runs.
//!
//! A single thread owns every piece of mutable consensus state — the run
//! table, the packet heap, both trigger heaps, and the `next` frontier —
//! and multiplexes four inputs: store events, inbound packets, local
//! proposals, and ticker pulses. Nothing else mutates that state;
//! catch-up replies for finished slots run on short-lived threads that
//! only read the store and send one packet.
//!
//! Store events are the clock of the pipeline. The event for slot `s`
//! retires `run[s]` and installs a fresh run at `s + alpha`, so the node
//! never works more than `alpha` slots past what the store has sealed.
//! The pump enforces the matching gate on input: packets sit in the heap
//! until their slot's run exists.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use prost::Message as _;
use tracing::{debug, info, warn};

use crate::message::{Cmd, Envelope, Msg, Packet};
use crate::run::Run;
use crate::store::{Event, Mutation, Op, Store, StoreError};
use crate::trigger::{apply_triggers, nanotime, sched_trigger, Trigger};

/// A local request to bind `mutation` to slot `seqn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prop {
    pub seqn: u64,
    pub mutation: Vec<u8>,
}

/// Queue gauges and all-time totals, readable while the driver runs.
#[derive(Debug, Default)]
pub struct Stats {
    pub runs: AtomicUsize,
    pub wait_packets: AtomicUsize,
    pub wait_ticks: AtomicUsize,
    pub total_runs: AtomicU64,
    pub total_fills: AtomicU64,
    pub total_ticks: AtomicU64,
}

/// Configuration and channel plumbing for one consensus manager.
///
/// `def_rev` is the store rev at which this manager was defined; it
/// participates starting at `def_rev + alpha`. All channels are owned by
/// the caller; the manager never creates plumbing of its own.
pub struct Manager {
    pub self_id: String,
    pub def_rev: u64,
    /// Pipeline depth: how many slots past the store's frontier this node
    /// will drive.
    pub alpha: u64,
    /// Gap-fill delay in nanoseconds.
    pub t_fill: i64,
    pub store: Store,
    pub in_rx: Receiver<Packet>,
    pub out_tx: Sender<Packet>,
    pub ops_tx: Sender<Op>,
    pub pseqn_tx: Sender<u64>,
    pub props_rx: Receiver<Prop>,
    pub ticker_rx: Receiver<i64>,
    pub stats: Arc<Stats>,
}

impl Manager {
    /// Drive consensus until the store's event stream closes.
    pub fn run(self) -> Result<()> {
        Driver::new(self)?.run()
    }

    /// Run on a dedicated named thread, the way a node embeds the manager.
    ///
    /// An error from [`Manager::run`] means the store broke its contract;
    /// there is nothing sane to continue with, so the thread panics.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        let name = format!("consensus-{}", self.self_id);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Err(err) = self.run() {
                    panic!("consensus manager failed: {err:?}");
                }
            })
            .expect("failed to spawn consensus manager")
    }
}

struct Driver {
    mgr: Manager,
    runs: BTreeMap<u64, Run>,
    /// Smallest seqn with no run installed yet; the pump's gate.
    next: u64,
    packets: BinaryHeap<Envelope>,
    fills: BinaryHeap<Trigger>,
    ticks: BinaryHeap<Trigger>,
    fill_template: Msg,
    tick_template: Msg,
}

impl Driver {
    fn new(mgr: Manager) -> Result<Driver> {
        let mut fill_template = Msg::new(Cmd::Propose);
        fill_template.value = Some(Mutation::Nop.encode().context("encode nop sentinel")?);
        Ok(Driver {
            mgr,
            runs: BTreeMap::new(),
            next: 0,
            packets: BinaryHeap::new(),
            fills: BinaryHeap::new(),
            ticks: BinaryHeap::new(),
            fill_template,
            tick_template: Msg::new(Cmd::Tick),
        })
    }

    fn run(&mut self) -> Result<()> {
        let mut run_ch = self
            .mgr
            .store
            .wait(self.mgr.def_rev)
            .context("store cannot replay the manager's definition rev")?;

        loop {
            self.mgr.stats.runs.store(self.runs.len(), Ordering::Relaxed);
            self.mgr
                .stats
                .wait_packets
                .store(self.packets.len(), Ordering::Relaxed);
            self.mgr
                .stats
                .wait_ticks
                .store(self.ticks.len(), Ordering::Relaxed);

            crossbeam_channel::select! {
                recv(run_ch) -> event => {
                    let Ok(e) = event else {
                        info!("store event stream closed, consensus manager exiting");
                        return Ok(());
                    };
                    // The store just produced e.seqn, so the rev after it
                    // is always waitable; anything else is a broken store.
                    run_ch = self
                        .mgr
                        .store
                        .wait(e.seqn + 1)
                        .context("store refused resubscription after its own event")?;
                    self.event(e);
                    self.mgr.stats.total_runs.fetch_add(1, Ordering::Relaxed);
                }
                recv(self.mgr.in_rx) -> packet => {
                    let Ok(p) = packet else { return Ok(()) };
                    if let Some(env) = Envelope::decode(&p) {
                        debug!(addr = %env.addr, seqn = env.seqn(), cmd = ?env.command(), "recv");
                        self.packets.push(env);
                    }
                }
                recv(self.mgr.props_rx) -> prop => {
                    let Ok(pr) = prop else { return Ok(()) };
                    self.propose(pr, nanotime());
                }
                recv(self.mgr.ticker_rx) -> tick => {
                    let Ok(now) = tick else { return Ok(()) };
                    self.do_tick(now);
                }
            }

            self.pump();
        }
    }

    /// Drain every packet whose slot already has a run installed,
    /// dispatching in non-decreasing seqn order. Slots with no live run
    /// get a catch-up reply instead.
    fn pump(&mut self) {
        while let Some(head) = self.packets.peek() {
            if head.seqn() >= self.next {
                break;
            }
            let Some(p) = self.packets.pop() else {
                break;
            };
            match self.runs.get_mut(&p.seqn()) {
                Some(r) if !r.is_done() => r.update(&p, &mut self.ticks, nanotime()),
                _ => send_learn(self.mgr.out_tx.clone(), p, self.mgr.store.clone()),
            }
        }
    }

    fn do_tick(&mut self, now: i64) {
        let fills = apply_triggers(&mut self.packets, &mut self.fills, now, &self.fill_template);
        self.mgr
            .stats
            .total_fills
            .fetch_add(fills as u64, Ordering::Relaxed);
        if fills > 0 {
            debug!(count = fills, "applied fills");
        }

        let ticks = apply_triggers(&mut self.packets, &mut self.ticks, now, &self.tick_template);
        self.mgr
            .stats
            .total_ticks
            .fetch_add(ticks as u64, Ordering::Relaxed);
        if ticks > 0 {
            debug!(count = ticks, "applied ticks");
        }
    }

    /// Queue a proposal packet, then walk backwards from it scheduling a
    /// fill for every earlier slot some other node leads. The run table is
    /// a contiguous window, so the first absent slot ends the walk on both
    /// sides: compacted history lies below the window, uninstalled slots
    /// above it. A self-led slot also ends it — our own proposer already
    /// has that slot's seqn.
    fn propose(&mut self, pr: Prop, now: i64) {
        debug!(seqn = pr.seqn, "local proposal");
        let mut msg = Msg::new(Cmd::Propose);
        msg.seqn = Some(pr.seqn);
        msg.value = Some(pr.mutation);
        self.packets.push(Envelope::new("", msg));

        for n in (0..pr.seqn).rev() {
            match self.runs.get(&n) {
                Some(r) if !r.is_leader(&self.mgr.self_id) => {
                    sched_trigger(&mut self.fills, n, now, self.mgr.t_fill);
                }
                _ => break,
            }
        }
    }

    fn event(&mut self, e: Event) {
        debug!(seqn = e.seqn, "store event");
        if self.runs.remove(&e.seqn).is_some() {
            debug!(seqn = e.seqn, "retired run");
        }
        self.add_run(&e);
        debug!(runs = %fmt_runs(&self.runs), "run table");
    }

    /// Install the run for slot `e.seqn + alpha`, deriving its coordinator
    /// set from the event's snapshot. An empty set inherits membership
    /// from the previous slot; at the genesis event there is no previous
    /// slot, so an empty set there is a fatal configuration error.
    fn add_run(&mut self, e: &Event) {
        let seqn = e.seqn + self.mgr.alpha;
        let mut cals = get_cals(e);
        let mut addrs = get_addrs(e, &cals);
        if cals.is_empty() {
            let prev = self
                .runs
                .get(&(seqn - 1))
                .unwrap_or_else(|| panic!("no coordinators defined at rev {}", e.seqn));
            cals = prev.cals.clone();
            addrs = prev.addrs.clone();
        }

        let r = Run::new(
            seqn,
            &self.mgr.self_id,
            cals,
            addrs,
            self.mgr.out_tx.clone(),
            self.mgr.ops_tx.clone(),
        );
        if r.is_leader(&self.mgr.self_id) {
            debug!(seqn, "leading slot");
            let _ = self.mgr.pseqn_tx.send(seqn);
        }
        debug!(seqn, "installed run");
        self.runs.insert(seqn, r);
        self.next = seqn + 1;
    }
}

/// Answer a packet for a slot this node no longer runs. Only an `invite`
/// warrants a reply: the questioner is trying to open a slot the store has
/// already sealed, so the committed event becomes a `learn` sent straight
/// back. The reply runs on its own thread and never touches driver state.
fn send_learn(out: Sender<Packet>, p: Envelope, store: Store) {
    if p.command() != Some(Cmd::Invite) {
        return;
    }
    thread::spawn(move || {
        let seqn = p.seqn();
        match store.wait(seqn) {
            Err(StoreError::TooLate(_)) => {
                warn!(seqn, addr = %p.addr, "slot compacted, cannot satisfy catch-up");
            }
            Ok(events) => {
                let Ok(e) = events.recv() else { return };
                let mut m = Msg::new(Cmd::Learn);
                m.seqn = Some(e.seqn);
                m.value = Some(e.mutation);
                let _ = out.send(Packet {
                    addr: p.addr,
                    data: m.encode_to_vec(),
                });
            }
        }
    });
}

/// Coordinator ids for a slot, projected from a store snapshot. The sort
/// makes every node derive the same ordering from the same rev.
fn get_cals(g: &Event) -> Vec<String> {
    let mut cals: Vec<String> = g
        .getdir("/ctl/cal")
        .iter()
        .map(|ent| g.get_string(&format!("/ctl/cal/{ent}")))
        .filter(|id| !id.is_empty())
        .collect();
    cals.sort();
    cals
}

/// Network addresses parallel to `cals`.
fn get_addrs(g: &Event, cals: &[String]) -> Vec<String> {
    cals.iter()
        .map(|id| g.get_string(&format!("/ctl/node/{id}/addr")))
        .collect()
}

/// One character per live run: `X` done, `o` proposed, `.` still open.
fn fmt_runs(runs: &BTreeMap<u64, Run>) -> String {
    runs.values()
        .map(|r| {
            if r.is_done() {
                'X'
            } else if r.has_proposal() {
                'o'
            } else {
                '.'
            }
        })
        .collect()
}
