//! Allow: three-round session-key agreement handshake (spec §4.4
//! "Allower/Allowent").

use std::time::Instant;

use serde_json::json;

use crate::packet::PacketKind;

use super::{Inbound, TxHeader, TxOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllowerState {
    SentHello,
    SentInitiate,
    Done,
    Failed,
}

/// Initiates an allow: `hello -> cookie(recv) -> initiate -> ack(recv) -> done`.
#[derive(Debug, Clone)]
pub struct Allower {
    pub(crate) header: TxHeader,
    state: AllowerState,
    pub cascade: bool,
    sent_hello: bool,
}

impl Allower {
    /// Builds a fresh allower; call [`Allower::process`] once to send hello.
    pub fn new(header: TxHeader, cascade: bool) -> Self {
        Self {
            header,
            state: AllowerState::SentHello,
            cascade,
            sent_hello: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent_hello {
            self.sent_hello = true;
            return vec![TxOutcome::Send {
                pk: PacketKind::Hello,
                body: None,
            }];
        }
        if !matches!(self.state, AllowerState::Done | AllowerState::Failed) && self.header.expired(now) {
            self.state = AllowerState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        match (self.state, inbound.pk) {
            (AllowerState::SentHello, PacketKind::Cookie) => {
                self.state = AllowerState::SentInitiate;
                vec![TxOutcome::Send {
                    pk: PacketKind::Initiate,
                    body: Some(json!({"stage": "initiate"})),
                }]
            }
            (AllowerState::SentInitiate, PacketKind::Ack) => {
                self.state = AllowerState::Done;
                vec![TxOutcome::Done]
            }
            (_, PacketKind::Nack) => {
                self.state = AllowerState::Failed;
                vec![TxOutcome::Failed]
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = AllowerState::Failed;
        vec![TxOutcome::Failed]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllowentState {
    AwaitingInitiate,
    Done,
    Failed,
}

/// Responds to a hello: `recv hello -> cookie -> recv initiate -> ack -> done`.
#[derive(Debug, Clone)]
pub struct Allowent {
    pub(crate) header: TxHeader,
    state: AllowentState,
    sent_cookie: bool,
}

impl Allowent {
    /// Builds a correspondent for an inbound hello.
    pub fn new(header: TxHeader) -> Self {
        Self {
            header,
            state: AllowentState::AwaitingInitiate,
            sent_cookie: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent_cookie {
            self.sent_cookie = true;
            return vec![TxOutcome::Send {
                pk: PacketKind::Cookie,
                body: Some(json!({"stage": "cookie"})),
            }];
        }
        if self.state == AllowentState::AwaitingInitiate && self.header.expired(now) {
            self.state = AllowentState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        if self.state == AllowentState::AwaitingInitiate && inbound.pk == PacketKind::Initiate {
            self.state = AllowentState::Done;
            return vec![
                TxOutcome::Send {
                    pk: PacketKind::Ack,
                    body: None,
                },
                TxOutcome::Done,
            ];
        }
        Vec::new()
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = AllowentState::Failed;
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
            3,
            7,
            TxData {
                hk: HeaderKind::Raet,
                bk: BodyKind::Raw,
                fk: FootKind::NaclSig,
                ck: CoatKind::None,
            },
            Instant::now(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn full_handshake_completes() {
        let mut initiator = Allower::new(header(), false);
        let mut correspondent = Allowent::new(header());

        let hello = initiator.process(Instant::now());
        assert!(matches!(hello[0], TxOutcome::Send { pk: PacketKind::Hello, .. }));

        let cookie = correspondent.process(Instant::now());
        assert!(matches!(cookie[0], TxOutcome::Send { pk: PacketKind::Cookie, .. }));

        let initiate = initiator.receive(Inbound {
            pk: PacketKind::Cookie,
            si: 3,
            bf: false,
            body: None,
        });
        assert!(matches!(initiate[0], TxOutcome::Send { pk: PacketKind::Initiate, .. }));

        let ack = correspondent.receive(Inbound {
            pk: PacketKind::Initiate,
            si: 3,
            bf: false,
            body: None,
        });
        assert!(ack.iter().any(|o| matches!(o, TxOutcome::Done)));

        let done = initiator.receive(Inbound {
            pk: PacketKind::Ack,
            si: 3,
            bf: false,
            body: None,
        });
        assert!(done.iter().any(|o| matches!(o, TxOutcome::Done)));
    }
}
