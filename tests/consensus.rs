//! End-to-end driver scenarios: deciding a value with a single-node
//! quorum, gap fills, heap-ordered dispatch, and the sequence gate.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use prost::Message as _;

use paxos_pipeline::manager::{Manager, Prop, Stats};
use paxos_pipeline::message::{Cmd, Msg, Packet};
use paxos_pipeline::store::{Mutation, Op, Store};
use paxos_pipeline::trigger::nanotime;

const RECV_DEADLINE: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(150);

/// One consensus manager wired for tests. Packets the node addresses to
/// itself loop straight back into its inbound channel; everything bound
/// for a peer lands on `wire_rx` for assertions.
struct TestNode {
    in_tx: Sender<Packet>,
    props_tx: Sender<Prop>,
    ticker_tx: Sender<i64>,
    wire_rx: Receiver<Packet>,
    ops_rx: Receiver<Op>,
    pseqn_rx: Receiver<u64>,
    stats: Arc<Stats>,
}

impl TestNode {
    fn spawn(
        self_id: &str,
        self_addr: &str,
        def_rev: u64,
        alpha: u64,
        t_fill: i64,
        store: Store,
    ) -> TestNode {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded::<Packet>();
        let (ops_tx, ops_rx) = unbounded();
        let (pseqn_tx, pseqn_rx) = unbounded();
        let (props_tx, props_rx) = unbounded();
        let (ticker_tx, ticker_rx) = unbounded();
        let (wire_tx, wire_rx) = unbounded();
        let stats = Arc::new(Stats::default());

        Manager {
            self_id: self_id.to_string(),
            def_rev,
            alpha,
            t_fill,
            store,
            in_rx,
            out_tx,
            ops_tx,
            pseqn_tx,
            props_rx,
            ticker_rx,
            stats: Arc::clone(&stats),
        }
        .spawn();

        let loop_tx = in_tx.clone();
        let self_addr = self_addr.to_string();
        thread::spawn(move || {
            for p in out_rx {
                let forward = if p.addr == self_addr {
                    loop_tx.send(p).is_ok()
                } else {
                    wire_tx.send(p).is_ok()
                };
                if !forward {
                    break;
                }
            }
        });

        TestNode {
            in_tx,
            props_tx,
            ticker_tx,
            wire_rx,
            ops_rx,
            pseqn_rx,
            stats,
        }
    }

    fn send(&self, addr: &str, msg: Msg) {
        let packet = Packet {
            addr: addr.to_string(),
            data: msg.encode_to_vec(),
        };
        self.in_tx.send(packet).expect("manager inbound closed");
    }
}

fn single_node_tree(id: &str, addr: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("/ctl/cal/0".to_string(), id.to_string()),
        (format!("/ctl/node/{id}/addr"), addr.to_string()),
    ])
}

fn invite(seqn: u64, crnd: u64) -> Msg {
    let mut m = Msg::new(Cmd::Invite);
    m.seqn = Some(seqn);
    m.crnd = Some(crnd);
    m
}

fn decode(p: &Packet) -> Msg {
    Msg::decode(p.data.as_slice()).expect("outbound packets decode")
}

#[test]
fn single_node_learns_its_own_proposal() -> Result<()> {
    let store = Store::new(single_node_tree("a", "a.test:1"));
    let node = TestNode::spawn("a", "a.test:1", 0, 1, 10_000_000, store);

    let led = node.pseqn_rx.recv_timeout(RECV_DEADLINE)?;
    assert_eq!(led, 1, "the genesis event leads slot 1");

    node.props_tx.send(Prop {
        seqn: 1,
        mutation: b"x".to_vec(),
    })?;

    let op = node.ops_rx.recv_timeout(RECV_DEADLINE)?;
    assert_eq!(
        op,
        Op {
            seqn: 1,
            mutation: b"x".to_vec()
        }
    );
    Ok(())
}

#[test]
fn proposal_fills_slots_led_elsewhere() -> Result<()> {
    // Slot 2's membership names only "b"; slot 3 adds "a". Alpha 2 keeps
    // both runs live at once.
    let tree = BTreeMap::from([
        ("/ctl/cal/0".to_string(), "b".to_string()),
        ("/ctl/node/a/addr".to_string(), "a.test:1".to_string()),
        ("/ctl/node/b/addr".to_string(), "b.test:1".to_string()),
    ]);
    let store = Store::new(tree);
    let t_fill = 10_000_000; // 10ms
    let node = TestNode::spawn("a", "a.test:1", 0, 2, t_fill, store.clone());

    let m = Mutation::Assign {
        path: "/ctl/cal/1".to_string(),
        value: "a".to_string(),
    };
    store.commit(1, m.encode()?);
    assert_eq!(node.pseqn_rx.recv_timeout(RECV_DEADLINE)?, 3);

    node.props_tx.send(Prop {
        seqn: 3,
        mutation: b"z".to_vec(),
    })?;

    // Let the fill deadline pass, then tick.
    thread::sleep(Duration::from_millis(50));
    node.ticker_tx.send(nanotime())?;

    // The fill proposes a nop at slot 2, so this node's coordinator opens
    // that slot by inviting b.
    loop {
        let p = node.wire_rx.recv_timeout(RECV_DEADLINE)?;
        let m = decode(&p);
        if p.addr == "b.test:1" && m.seqn == Some(2) && m.command() == Some(Cmd::Invite) {
            break;
        }
    }
    assert_eq!(node.stats.total_fills.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn pump_dispatches_held_packets_in_seqn_order() -> Result<()> {
    let store = Store::new(single_node_tree("a", "a.test:1"));
    let node = TestNode::spawn("a", "a.test:1", 0, 1, 10_000_000, store.clone());
    assert_eq!(node.pseqn_rx.recv_timeout(RECV_DEADLINE)?, 1);

    // next is 2; everything at or above it must wait in the heap.
    for seqn in [4, 2, 3] {
        node.send("peer.test:9", invite(seqn, 9));
    }
    thread::sleep(SETTLE);
    assert!(
        node.wire_rx.try_recv().is_err(),
        "packets at or above next must be held"
    );

    for seqn in 1..=3 {
        store.commit(seqn, Mutation::Nop.encode()?);
    }

    // Each store event releases the smallest queued slot first.
    for expect in [2, 3, 4] {
        let p = node.wire_rx.recv_timeout(RECV_DEADLINE)?;
        let m = decode(&p);
        assert_eq!(p.addr, "peer.test:9");
        assert_eq!(m.command(), Some(Cmd::Rsvp));
        assert_eq!(m.seqn, Some(expect));
    }
    Ok(())
}

#[test]
fn sequence_gate_holds_far_future_packets() -> Result<()> {
    let store = Store::new(single_node_tree("a", "a.test:1"));
    let node = TestNode::spawn("a", "a.test:1", 0, 1, 10_000_000, store.clone());
    assert_eq!(node.pseqn_rx.recv_timeout(RECV_DEADLINE)?, 1);

    node.send("peer.test:9", invite(5, 9));
    thread::sleep(SETTLE);
    assert!(
        node.wire_rx.try_recv().is_err(),
        "slot 5 has no run yet, the packet must wait"
    );

    for seqn in 1..=4 {
        store.commit(seqn, Mutation::Nop.encode()?);
    }

    let p = node.wire_rx.recv_timeout(RECV_DEADLINE)?;
    let m = decode(&p);
    assert_eq!(m.command(), Some(Cmd::Rsvp), "run 5 answers once installed");
    assert_eq!(m.seqn, Some(5));
    Ok(())
}
