//! Wire message model for the consensus protocol.
//!
//! Every datagram carries exactly one [`Msg`], a record with optional
//! fields in the proto2 style: `seqn` names the log slot, `cmd` says what
//! the message is, and the ballot/value fields are present only where the
//! command calls for them. Messages missing `seqn` or `cmd` are dropped at
//! decode time with a log line and no reply.

use std::cmp::Ordering;

use prost::Message as _;
use tracing::warn;

/// A raw datagram paired with the peer address it came from or goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub addr: String,
    pub data: Vec<u8>,
}

/// Protocol commands.
///
/// `invite`/`rsvp` are Paxos phase one, `nominate`/`vote` phase two.
/// `propose` and `tick` never cross the wire to another node: the first
/// carries a local proposal into a coordinator, the second nudges a run to
/// retransmit its outstanding round. `learn` announces a decided value to
/// a node that asked about a finished slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Cmd {
    Invite = 1,
    Rsvp = 2,
    Nominate = 3,
    Vote = 4,
    Tick = 5,
    Propose = 6,
    Learn = 7,
}

/// One consensus message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Msg {
    #[prost(uint64, optional, tag = "1")]
    pub seqn: Option<u64>,
    #[prost(enumeration = "Cmd", optional, tag = "2")]
    pub cmd: Option<i32>,
    #[prost(uint64, optional, tag = "3")]
    pub crnd: Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub vrnd: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub value: Option<Vec<u8>>,
}

impl Msg {
    /// An otherwise-empty message carrying `cmd`.
    pub fn new(cmd: Cmd) -> Msg {
        Msg {
            cmd: Some(cmd as i32),
            ..Msg::default()
        }
    }

    /// The command, if present and known. Unknown discriminants read as
    /// absent so the packet is dropped rather than misrouted.
    pub fn command(&self) -> Option<Cmd> {
        self.cmd.and_then(|raw| Cmd::try_from(raw).ok())
    }
}

/// A decoded message paired with its return address.
///
/// Envelopes order by `seqn` alone, reversed, so a `BinaryHeap` of them
/// pops the smallest slot first. Equality follows the same key: duplicates
/// are allowed and ties dispatch in no particular order.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub addr: String,
    pub msg: Msg,
}

impl Envelope {
    pub fn new(addr: impl Into<String>, msg: Msg) -> Envelope {
        Envelope {
            addr: addr.into(),
            msg,
        }
    }

    pub fn seqn(&self) -> u64 {
        self.msg.seqn.unwrap_or(0)
    }

    pub fn command(&self) -> Option<Cmd> {
        self.msg.command()
    }

    /// Decode one datagram, dropping anything malformed or incomplete.
    pub fn decode(p: &Packet) -> Option<Envelope> {
        let msg = match Msg::decode(p.data.as_slice()) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(addr = %p.addr, error = %err, "dropping undecodable packet");
                return None;
            }
        };
        if msg.seqn.is_none() || msg.command().is_none() {
            warn!(addr = %p.addr, "dropping packet without seqn or cmd");
            return None;
        }
        Some(Envelope {
            addr: p.addr.clone(),
            msg,
        })
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Envelope) -> bool {
        self.seqn() == other.seqn()
    }
}

impl Eq for Envelope {}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Envelope) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Envelope {
    fn cmp(&self, other: &Envelope) -> Ordering {
        other.seqn().cmp(&self.seqn())
    }
}
