//! Minimal consensus node: one manager over UDP, an in-memory store, and
//! a stdin proposer.
//!
//! Lines read from stdin become `Assign` proposals, each bound to the next
//! slot this node leads. Every member runs the same binary:
//!
//! ```text
//! node --id a --listen 127.0.0.1:8001 \
//!     --member a=127.0.0.1:8001 --member b=127.0.0.1:8002
//! ```

use std::collections::BTreeMap;
use std::io::BufRead;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use paxos_pipeline::manager::{Manager, Prop, Stats};
use paxos_pipeline::message::Packet;
use paxos_pipeline::store::{Mutation, Store};
use paxos_pipeline::trigger::nanotime;

const TICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(about = "Run one consensus node over UDP")]
struct Args {
    /// This node's id.
    #[arg(long)]
    id: String,

    /// UDP address to bind; must match this node's --member entry.
    #[arg(long)]
    listen: String,

    /// Cluster members as id=addr pairs, including this node.
    #[arg(long = "member", value_parser = parse_member, required = true)]
    members: Vec<(String, String)>,

    /// Pipeline depth.
    #[arg(long, default_value_t = 1)]
    alpha: u64,

    /// Gap-fill delay in milliseconds.
    #[arg(long, default_value_t = 100)]
    fill_ms: u64,
}

fn parse_member(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(id, addr)| (id.to_string(), addr.to_string()))
        .ok_or_else(|| format!("expected id=addr, got {s:?}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut tree = BTreeMap::new();
    for (i, (id, addr)) in args.members.iter().enumerate() {
        tree.insert(format!("/ctl/cal/{i}"), id.clone());
        tree.insert(format!("/ctl/node/{id}/addr"), addr.clone());
    }
    let store = Store::new(tree);
    // The first alpha-1 slots precede any run this manager installs; seed
    // them so the pipeline has a committed frontier to grow from.
    for seqn in 1..args.alpha {
        store.commit(seqn, Mutation::Nop.encode()?);
    }

    let (in_tx, in_rx) = unbounded();
    let (out_tx, out_rx) = unbounded::<Packet>();
    let (ops_tx, ops_rx) = unbounded();
    let (pseqn_tx, pseqn_rx) = unbounded();
    let (props_tx, props_rx) = unbounded();
    let (ticker_tx, ticker_rx) = unbounded();

    let manager = Manager {
        self_id: args.id.clone(),
        def_rev: 0,
        alpha: args.alpha,
        t_fill: (args.fill_ms as i64) * 1_000_000,
        store: store.clone(),
        in_rx,
        out_tx,
        ops_tx,
        pseqn_tx,
        props_rx,
        ticker_rx,
        stats: Arc::new(Stats::default()),
    };
    let driver = manager.spawn();

    let socket = UdpSocket::bind(&args.listen)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(id = %args.id, addr = %args.listen, "node listening");

    // Inbound datagrams feed the manager's packet channel.
    let recv_socket = socket.try_clone().context("failed to clone socket")?;
    thread::spawn(move || {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match recv_socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    let packet = Packet {
                        addr: src.to_string(),
                        data: buf[..len].to_vec(),
                    };
                    if in_tx.send(packet).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "udp recv failed");
                    break;
                }
            }
        }
    });

    // Outbound packets go straight onto the wire, best effort.
    thread::spawn(move || {
        for p in out_rx {
            if let Err(err) = socket.send_to(&p.data, &p.addr) {
                debug!(addr = %p.addr, error = %err, "udp send failed");
            }
        }
    });

    // The ticker drives fills and retransmission.
    thread::spawn(move || loop {
        thread::sleep(TICK_INTERVAL);
        if ticker_tx.send(nanotime()).is_err() {
            break;
        }
    });

    // Learned ops flow back into the store, advancing the pipeline.
    let ops_store = store.clone();
    thread::spawn(move || {
        for op in ops_rx {
            ops_store.commit(op.seqn, op.mutation);
        }
    });

    // Each stdin line consumes the next slot this node leads.
    for line in std::io::stdin().lock().lines() {
        let line = line.context("stdin read failed")?;
        let Some((path, value)) = line.split_once(' ') else {
            warn!("expected: <path> <value>");
            continue;
        };
        let mutation = Mutation::Assign {
            path: path.to_string(),
            value: value.to_string(),
        }
        .encode()?;

        let seqn = pseqn_rx
            .recv()
            .context("manager stopped publishing leader slots")?;
        info!(seqn, path, "proposing");
        props_tx.send(Prop { seqn, mutation })?;
    }

    store.close();
    driver.join().ok();
    Ok(())
}
