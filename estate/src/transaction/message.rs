//! Message: application-payload transport, with optional broadcast and
//! wait semantics (spec §4.4 "Messenger/Messengent").

use std::time::Instant;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::packet::PacketKind;

use super::{Inbound, TxHeader, TxOutcome};

/// Validates that `body` is a keyed mapping, per spec §4.4 ("Payload must
/// be a keyed mapping; non-mapping payloads are rejected at enqueue
/// time").
pub fn validate_body(body: &Value) -> Result<()> {
    if body.is_object() {
        Ok(())
    } else {
        Err(Error::InvalidTransmitBody)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessengerState {
    Sent,
    Done,
    Failed,
}

/// Sends one application payload; if `wait` is set, the transaction is
/// only `Done` once an ack is received, otherwise it completes
/// immediately after sending (fire-and-forget).
#[derive(Debug, Clone)]
pub struct Messenger {
    pub(crate) header: TxHeader,
    state: MessengerState,
    body: Option<Value>,
    pub bcst: bool,
    pub wait: bool,
    sent: bool,
}

impl Messenger {
    /// Builds a messenger carrying `body`.
    pub fn new(header: TxHeader, body: Value, bcst: bool, wait: bool) -> Self {
        Self {
            header,
            state: MessengerState::Sent,
            body: Some(body),
            bcst,
            wait,
            sent: false,
        }
    }

    pub(crate) fn process(&mut self, now: Instant) -> Vec<TxOutcome> {
        if !self.sent {
            self.sent = true;
            let body = self.body.take();
            let mut outcomes = vec![TxOutcome::Send {
                pk: PacketKind::Message,
                body,
            }];
            if !self.wait {
                self.state = MessengerState::Done;
                outcomes.push(TxOutcome::Done);
            }
            return outcomes;
        }
        if self.state == MessengerState::Sent && self.wait && self.header.expired(now) {
            self.state = MessengerState::Failed;
            return vec![TxOutcome::Failed];
        }
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        if self.wait && self.state == MessengerState::Sent && inbound.pk == PacketKind::Ack {
            self.state = MessengerState::Done;
            return vec![TxOutcome::Done];
        }
        Vec::new()
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        self.state = MessengerState::Failed;
        vec![TxOutcome::Failed]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessengentState {
    AwaitingDeliver,
    Done,
}

/// Receives one application payload and acknowledges it.
#[derive(Debug, Clone)]
pub struct Messengent {
    pub(crate) header: TxHeader,
    state: MessengentState,
    pub bcst: bool,
}

impl Messengent {
    /// Builds a correspondent for an inbound message packet.
    pub fn new(header: TxHeader, bcst: bool) -> Self {
        Self {
            header,
            state: MessengentState::AwaitingDeliver,
            bcst,
        }
    }

    pub(crate) fn process(&mut self, _now: Instant) -> Vec<TxOutcome> {
        Vec::new()
    }

    pub(crate) fn receive(&mut self, inbound: Inbound) -> Vec<TxOutcome> {
        if self.state == MessengentState::AwaitingDeliver && inbound.pk == PacketKind::Message {
            self.state = MessengentState::Done;
            let mut outcomes = vec![TxOutcome::Send {
                pk: PacketKind::Ack,
                body: None,
            }];
            if let Some(body) = inbound.body {
                outcomes.push(TxOutcome::Deliver(body));
            }
            outcomes.push(TxOutcome::Done);
            return outcomes;
        }
        Vec::new()
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        vec![TxOutcome::Failed]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BodyKind, CoatKind, FootKind, HeaderKind};
    use crate::transaction::TxData;
    use serde_json::json;
    use std::time::Duration;

    fn header() -> TxHeader {
        TxHeader::new(
            1,
            5,
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
    fn non_mapping_body_is_rejected() {
        assert!(validate_body(&json!([1, 2, 3])).is_err());
        assert!(validate_body(&json!({"a": 1})).is_ok());
    }

    #[test]
    fn fire_and_forget_completes_immediately() {
        let mut m = Messenger::new(header(), json!({"a": 1}), false, false);
        let outcomes = m.process(Instant::now());
        assert!(outcomes.iter().any(|o| matches!(o, TxOutcome::Done)));
    }

    #[test]
    fn waiting_messenger_needs_ack() {
        let mut m = Messenger::new(header(), json!({"a": 1}), false, true);
        let outcomes = m.process(Instant::now());
        assert!(!outcomes.iter().any(|o| matches!(o, TxOutcome::Done)));
        let outcomes = m.receive(Inbound {
            pk: PacketKind::Ack,
            si: 5,
            bf: false,
            body: None,
        });
        assert!(outcomes.iter().any(|o| matches!(o, TxOutcome::Done)));
    }

    #[test]
    fn messengent_delivers_and_acks() {
        let mut mt = Messengent::new(header(), false);
        let outcomes = mt.receive(Inbound {
            pk: PacketKind::Message,
            si: 5,
            bf: false,
            body: Some(json!({"hello": "world"})),
        });
        assert!(outcomes.iter().any(|o| matches!(o, TxOutcome::Send { pk: PacketKind::Ack, .. })));
        assert!(outcomes.iter().any(|o| matches!(o, TxOutcome::Deliver(_))));
        assert!(outcomes.iter().any(|o| matches!(o, TxOutcome::Done)));
    }
}
