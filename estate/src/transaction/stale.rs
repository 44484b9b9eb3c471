//! Stale: emits one nack for a packet that could not be matched to any
//! transaction (spec §4.4 "Staler").

use std::time::Instant;

use crate::packet::PacketKind;

use super::{Inbound, TxHeader, TxOutcome};

/// A one-shot nack emitter. Terminates immediately after its first
/// `process` call.
#[derive(Debug, Clone)]
pub struct Staler {
    pub(crate) header: TxHeader,
    fired: bool,
}

impl Staler {
    /// Builds a staler that will nack on the next `process` call.
    pub fn new(header: TxHeader) -> Self {
        Self {
            header,
            fired: false,
        }
    }

    pub(crate) fn process(&mut self, _now: Instant) -> Vec<TxOutcome> {
        if self.fired {
            return Vec::new();
        }
        self.fired = true;
        vec![
            TxOutcome::Send {
                pk: PacketKind::Nack,
                body: None,
            },
            TxOutcome::Done,
        ]
    }

    pub(crate) fn receive(&mut self, _inbound: Inbound) -> Vec<TxOutcome> {
        Vec::new()
    }

    pub(crate) fn cancel(&mut self) -> Vec<TxOutcome> {
        vec![TxOutcome::Done]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BodyKind, CoatKind, FootKind, HeaderKind};
    use crate::transaction::TxData;
    use std::time::Duration;

    #[test]
    fn nacks_once_then_terminates() {
        let header = TxHeader::new(
            1,
            9,
            7,
            TxData {
                hk: HeaderKind::Raet,
                bk: BodyKind::Json,
                fk: FootKind::None,
                ck: CoatKind::None,
            },
            Instant::now(),
            Duration::from_secs(1),
        );
        let mut staler = Staler::new(header);
        let outcomes = staler.process(Instant::now());
        assert!(matches!(outcomes[0], TxOutcome::Send { pk: PacketKind::Nack, .. }));
        assert!(matches!(outcomes[1], TxOutcome::Done));
        assert!(staler.process(Instant::now()).is_empty());
    }
}
