//! Alive: single-round liveness probe, gated by an established session
//! key (spec §4.4 "Aliver/Alivent").

use std::time::Instant;

use serde_json::json;

use crate::packet::PacketKind;

use super::{Inbound, TxHeader, TxOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliverState {
    SentRequest,
    Done,
    Failed,
}

/// Initiates an alive probe: `request -> {response -> done | timeout -> failed}`.
#[derive(Debug, Clone)]
pub struct Aliver {
    pub(crate) header: TxHeader,
    state: AliverState,
    pub cascade: bool,
    sent: bool,
}

impl Aliver {
    /// Builds a fresh aliver; call [`Aliver::process`] once to send the probe.
    pub fn new(header: TxHeader, cascade: bool) -> Self {
        Self {
            header,
            state: AliverState::SentRequest,
            cascade,
            sent: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent {
            self.sent = true;
            return vec![TxOutcome::Send {
                pk: PacketKind::Request,
                body: Some(json!({"ping": true})),
            }];
        }
        if self.state == AliverState::SentRequest && self.header.expired(now) {
            self.state = AliverState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        match inbound.pk {
            PacketKind::Response => {
                self.state = AliverState::Done;
                vec![
                    TxOutcome::Send {
                        pk: PacketKind::Ack,
                        body: None,
                    },
                    TxOutcome::Done,
                ]
            }
            PacketKind::Nack => {
                self.state = AliverState::Failed;
                vec![TxOutcome::Failed]
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = AliverState::Failed;
        vec![TxOutcome::Failed]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliventState {
    SentResponse,
    Done,
    Failed,
}

/// Responds to an alive probe: `request(recv) -> response -> {ack(recv) -> done | timeout -> failed}`.
#[derive(Debug, Clone)]
pub struct Alivent {
    pub(crate) header: TxHeader,
    state: AliventState,
    /// Whether the probe that spawned this transaction was a broadcast.
    pub bcst: bool,
    sent: bool,
}

impl Alivent {
    /// Builds a correspondent for an inbound alive request.
    pub fn new(header: TxHeader, bcst: bool) -> Self {
        Self {
            header,
            state: AliventState::SentResponse,
            bcst,
            sent: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent {
            self.sent = true;
            return vec![TxOutcome::Send {
                pk: PacketKind::Response,
                body: Some(json!({"pong": true})),
            }];
        }
        if self.state == AliventState::SentResponse && self.header.expired(now) {
            self.state = AliventState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        if inbound.pk == PacketKind::Ack {
            self.state = AliventState::Done;
            return vec![TxOutcome::Done];
        }
        Vec::new()
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = AliventState::Failed;
        vec![TxOutcome::Failed]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxData;
    use crate::packet::{BodyKind, CoatKind, FootKind, HeaderKind};
    use std::time::Duration;

    fn header() -> TxHeader {
        TxHeader::new(
            1,
            4,
            7,
            TxData {
                hk: HeaderKind::Raet,
                bk: BodyKind::Json,
                fk: FootKind::NaclSig,
                ck: CoatKind::NaclBox,
            },
            Instant::now(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn round_trip_completes_both_sides() {
        let mut aliver = Aliver::new(header(), false);
        let mut alivent = Alivent::new(header(), false);

        aliver.process(Instant::now());
        alivent.process(Instant::now());

        let ack_outcome = alivent.receive(Inbound {
            pk: PacketKind::Ack,
            si: 4,
            bf: false,
            body: None,
        });
        assert!(ack_outcome.iter().any(|o| matches!(o, TxOutcome::Done)));

        let response_outcome = aliver.receive(Inbound {
            pk: PacketKind::Response,
            si: 4,
            bf: false,
            body: None,
        });
        assert!(response_outcome.iter().any(|o| matches!(o, TxOutcome::Done)));
    }

    #[test]
    fn aliver_times_out() {
        let mut h = header();
        h.deadline = Instant::now();
        let mut aliver = Aliver::new(h, false);
        aliver.process(Instant::now());
        let outcomes = aliver.process(Instant::now() + Duration::from_millis(1));
        assert!(matches!(outcomes[0], TxOutcome::Failed));
    }
}
