//! Join: session establishment handshake (spec §4.4 "Joiner/Joinent").

use std::time::Instant;

use serde_json::json;

use crate::packet::PacketKind;

use super::{Inbound, TxHeader, TxOutcome};

/// State of a [`Joiner`] (initiator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinerState {
    SentRequest,
    Done,
    Failed,
}

/// Initiates a join: `init -> sent_request -> {done | failed}`.
#[derive(Debug, Clone)]
pub struct Joiner {
    pub(crate) header: TxHeader,
    state: JoinerState,
    /// Whether a failing join should cascade into a retry chain; read by
    /// the stack's `manage`, not acted on here.
    pub cascade: bool,
    sent: bool,
}

impl Joiner {
    /// Builds a fresh joiner; call [`Joiner::process`] once to emit the
    /// initial request.
    pub fn new(header: TxHeader, cascade: bool) -> Self {
        Self {
            header,
            state: JoinerState::SentRequest,
            cascade,
            sent: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent {
            self.sent = true;
            return vec![TxOutcome::Send {
                pk: PacketKind::Request,
                body: Some(json!({"role": "join"})),
            }];
        }
        if self.state == JoinerState::SentRequest && self.header.expired(now) {
            self.state = JoinerState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        match inbound.pk {
            PacketKind::Response => {
                self.state = JoinerState::Done;
                vec![
                    TxOutcome::Send {
                        pk: PacketKind::Ack,
                        body: None,
                    },
                    TxOutcome::Done,
                ]
            }
            PacketKind::Nack => {
                self.state = JoinerState::Failed;
                vec![TxOutcome::Failed]
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = JoinerState::Failed;
        vec![TxOutcome::Failed]
    }
}

/// State of a [`Joinent`] (correspondent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinentState {
    SentResponse,
    Done,
    Failed,
}

/// Responds to a join request: `init -> sent_response -> {done | failed}`.
#[derive(Debug, Clone)]
pub struct Joinent {
    pub(crate) header: TxHeader,
    state: JoinentState,
    sent: bool,
}

impl Joinent {
    /// Builds a correspondent for an inbound join request.
    pub fn new(header: TxHeader) -> Self {
        Self {
            header,
            state: JoinentState::SentResponse,
            sent: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent {
            self.sent = true;
            return vec![TxOutcome::Send {
                pk: PacketKind::Response,
                body: Some(json!({"role": "join"})),
            }];
        }
        if self.state == JoinentState::SentResponse && self.header.expired(now) {
            self.state = JoinentState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        if inbound.pk == PacketKind::Ack {
            self.state = JoinentState::Done;
            return vec![TxOutcome::Done];
        }
        Vec::new()
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = JoinentState::Failed;
        vec![TxOutcome::Failed]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BodyKind, CoatKind, FootKind, HeaderKind};
    use crate::transaction::TxData;
    use std::time::Duration;

    fn header() -> TxHeader {
        TxHeader::new(
            1,
            0,
            7,
            TxData {
                hk: HeaderKind::Raet,
                bk: BodyKind::Json,
                fk: FootKind::None,
                ck: CoatKind::None,
            },
            Instant::now(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn joiner_sends_request_then_completes_on_response() {
        let mut j = Joiner::new(header(), false);
        let outcomes = j.process(Instant::now());
        assert!(matches!(outcomes[0], TxOutcome::Send { pk: PacketKind::Request, .. }));

        let outcomes = j.receive(Inbound {
            pk: PacketKind::Response,
            si: 1,
            bf: false,
            body: None,
        });
        assert!(outcomes.iter().any(|o| matches!(o, TxOutcome::Done)));
    }

    #[test]
    fn joiner_fails_on_nack() {
        let mut j = Joiner::new(header(), false);
        j.process(Instant::now());
        let outcomes = j.receive(Inbound {
            pk: PacketKind::Nack,
            si: 1,
            bf: false,
            body: None,
        });
        assert!(matches!(outcomes[0], TxOutcome::Failed));
    }

    #[test]
    fn joinent_completes_on_ack() {
        let mut jt = Joinent::new(header());
        jt.process(Instant::now());
        let outcomes = jt.receive(Inbound {
            pk: PacketKind::Ack,
            si: 1,
            bf: false,
            body: None,
        });
        assert!(matches!(outcomes[0], TxOutcome::Done));
    }
}
