//! The transaction engine (spec §4.4): finite state machines dispatched
//! by `(kind, role)`, routed by [`TxIndex`].
//!
//! A transaction never holds an owning reference back to the `Stack` or
//! to its `Estate` (spec §9 "Cyclic references"); it is addressed by
//! `remote_uid` and resolved through the stack's registry on each call.
//! State transitions are reported as [`TxOutcome`]s; the stack is the only
//! thing that touches the socket, the crypto contract, or the packet
//! framing layer.

mod alive;
mod allow;
mod join;
mod message;
mod stale;

pub use alive::{Alivent, Aliver};
pub use allow::{Allowent, Allower};
pub use join::{Joinent, Joiner};
pub use message::{validate_body, Messengent, Messenger};
pub use stale::Staler;

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::packet::{BodyKind, CoatKind, FootKind, HeaderKind, PacketKind, TransactionKind};
use crate::socket::HostAddr;

/// Which side of a transaction this stack is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// This stack started the exchange.
    Initiator,
    /// This stack is responding to a peer-initiated exchange.
    Correspondent,
}

/// Identifies the remote side of a transaction before it necessarily has
/// a uid assigned (e.g. a fresh join request arrives from an address the
/// stack has never seen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// The remote's estate uid, once known.
    Uid(u32),
    /// The remote's host address, used only while bootstrapping.
    Addr(HostAddr),
}

/// The routing key a packet is matched against (spec §3 "Transaction
/// index"). Unique across the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxIndex {
    /// Which side of the transaction this index addresses.
    pub role: Role,
    /// Transaction kind.
    pub kind: TransactionKind,
    /// The peer this transaction is with.
    pub peer_key: PeerKey,
    /// Per-remote transaction id.
    pub tid: u32,
}

/// The header-kind template a transaction stamps on every packet it
/// sends, fixed at construction time per transaction kind (spec §4.4
/// table; join is plaintext, allow is raw, alive/message are
/// encrypted+signed).
#[derive(Debug, Clone, Copy)]
pub struct TxData {
    /// Header encoding.
    pub hk: HeaderKind,
    /// Body encoding.
    pub bk: BodyKind,
    /// Foot encoding.
    pub fk: FootKind,
    /// Coat encoding.
    pub ck: CoatKind,
}

impl TxData {
    /// Join transactions: plaintext body, no foot, no coat.
    pub fn for_join() -> Self {
        Self {
            hk: HeaderKind::Raet,
            bk: BodyKind::Json,
            fk: FootKind::None,
            ck: CoatKind::None,
        }
    }

    /// Allow transactions: JSON body (cookie/session-key stage payloads),
    /// signed, not yet coated (the coat key itself is what allow
    /// negotiates).
    pub fn for_allow() -> Self {
        Self {
            hk: HeaderKind::Raet,
            bk: BodyKind::Json,
            fk: FootKind::NaclSig,
            ck: CoatKind::None,
        }
    }

    /// Alive/message transactions: encrypted and signed.
    pub fn for_secured() -> Self {
        Self {
            hk: HeaderKind::Raet,
            bk: BodyKind::Json,
            fk: FootKind::NaclSig,
            ck: CoatKind::NaclBox,
        }
    }
}

/// A completed inbound packet, stripped to what a transaction's state
/// machine needs: its kind and (if already authenticated) its body.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The packet kind of the received packet.
    pub pk: PacketKind,
    /// The session id it carried.
    pub si: u32,
    /// Whether the broadcast flag was set.
    pub bf: bool,
    /// Decoded body, if any.
    pub body: Option<Value>,
}

/// What a transaction wants done as a result of `process`/`receive`.
/// The stack is responsible for turning `Send` into an actual wire
/// packet (applying this transaction's [`TxData`] and the remote's key
/// material) and for calling `remove_transaction` on `Done`/`Failed`.
#[derive(Debug, Clone)]
pub enum TxOutcome {
    /// Send a packet of kind `pk` with optional `body` to the remote.
    Send { pk: PacketKind, body: Option<Value> },
    /// A message transaction completed and produced an application
    /// payload for `rx_msgs`.
    Deliver(Value),
    /// The transaction finished successfully; remove it.
    Done,
    /// The transaction failed (timeout, nack, or bad input); remove it.
    Failed,
}

/// Common fields shared by every transaction role, factored out so each
/// role struct only needs to carry its own state enum.
#[derive(Debug, Clone)]
pub struct TxHeader {
    /// Per-remote transaction id.
    pub tid: u32,
    /// Session id this transaction runs under.
    pub sid: u32,
    /// The remote this transaction is with, addressed by uid.
    pub remote_uid: u32,
    /// Wire encoding template for outbound packets.
    pub tx_data: TxData,
    /// Absolute deadline; `process` fails the transaction once passed.
    pub deadline: Instant,
}

impl TxHeader {
    /// Builds a header with `timeout` measured from `now`.
    pub fn new(tid: u32, sid: u32, remote_uid: u32, tx_data: TxData, now: Instant, timeout: Duration) -> Self {
        Self {
            tid,
            sid,
            remote_uid,
            tx_data,
            deadline: now + timeout,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// A tagged union over the nine concrete transaction roles across the
/// five kinds in spec §4.4 (spec §9 "Tagged variants for transactions").
#[derive(Debug, Clone)]
pub enum Transaction {
    /// Join initiator.
    Joiner(Joiner),
    /// Join correspondent.
    Joinent(Joinent),
    /// Allow initiator.
    Allower(Allower),
    /// Allow correspondent.
    Allowent(Allowent),
    /// Alive initiator.
    Aliver(Aliver),
    /// Alive correspondent.
    Alivent(Alivent),
    /// Message initiator.
    Messenger(Messenger),
    /// Message correspondent.
    Messengent(Messengent),
    /// Stale-packet nack emitter.
    Staler(Staler),
}

impl Transaction {
    /// Transaction kind of the wrapped role.
    pub fn kind(&self) -> TransactionKind {
        match self {
            Transaction::Joiner(_) | Transaction::Joinent(_) => TransactionKind::Join,
            Transaction::Allower(_) | Transaction::Allowent(_) => TransactionKind::Allow,
            Transaction::Aliver(_) | Transaction::Alivent(_) => TransactionKind::Alive,
            Transaction::Messenger(_) | Transaction::Messengent(_) => TransactionKind::Message,
            Transaction::Staler(_) => TransactionKind::Stale,
        }
    }

    /// Role (initiator/correspondent) of the wrapped transaction.
    pub fn role(&self) -> Role {
        match self {
            Transaction::Joiner(_)
            | Transaction::Allower(_)
            | Transaction::Aliver(_)
            | Transaction::Messenger(_) => Role::Initiator,
            Transaction::Joinent(_)
            | Transaction::Allowent(_)
            | Transaction::Alivent(_)
            | Transaction::Messengent(_)
            | Transaction::Staler(_) => Role::Correspondent,
        }
    }

    /// Shared header fields of the wrapped transaction.
    pub fn header(&self) -> &TxHeader {
        match self {
            Transaction::Joiner(t) => &t.header,
            Transaction::Joinent(t) => &t.header,
            Transaction::Allower(t) => &t.header,
            Transaction::Allowent(t) => &t.header,
            Transaction::Aliver(t) => &t.header,
            Transaction::Alivent(t) => &t.header,
            Transaction::Messenger(t) => &t.header,
            Transaction::Messengent(t) => &t.header,
            Transaction::Staler(t) => &t.header,
        }
    }

    /// The routing index this transaction occupies.
    pub fn index(&self) -> TxIndex {
        TxIndex {
            role: self.role(),
            kind: self.kind(),
            peer_key: PeerKey::Uid(self.header().remote_uid),
            tid: self.header().tid,
        }
    }

    /// Timer-driven step.
    pub fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        match self {
            Transaction::Joiner(t) => t.process(now),
            Transaction::Joinent(t) => t.process(now),
            Transaction::Allower(t) => t.process(now),
            Transaction::Allowent(t) => t.process(now),
            Transaction::Aliver(t) => t.process(now),
            Transaction::Alivent(t) => t.process(now),
            Transaction::Messenger(t) => t.process(now),
            Transaction::Messengent(t) => t.process(now),
            Transaction::Staler(t) => t.process(now),
        }
    }

    /// Inbound packet dispatch.
    pub fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        match self {
            Transaction::Joiner(t) => t.receive(inbound),
            Transaction::Joinent(t) => t.receive(inbound),
            Transaction::Allower(t) => t.receive(inbound),
            Transaction::Allowent(t) => t.receive(inbound),
            Transaction::Aliver(t) => t.receive(inbound),
            Transaction::Alivent(t) => t.receive(inbound),
            Transaction::Messenger(t) => t.receive(inbound),
            Transaction::Messengent(t) => t.receive(inbound),
            Transaction::Staler(t) => t.receive(inbound),
        }
    }

    /// Cancels the transaction, emitting a nack where the kind calls for
    /// one (spec §5 "Cancellation").
    pub fn cancel(&mut self) -> Vec<TxOutcome> {
        match self {
            Transaction::Joiner(t) => t.cancel(),
            Transaction::Joinent(t) => t.cancel(),
            Transaction::Allower(t) => t.cancel(),
            Transaction::Allowent(t) => t.cancel(),
            Transaction::Aliver(t) => t.cancel(),
            Transaction::Alivent(t) => t.cancel(),
            Transaction::Messenger(t) => t.cancel(),
            Transaction::Messengent(t) => t.cancel(),
            Transaction::Staler(t) => t.cancel(),
        }
    }
}
