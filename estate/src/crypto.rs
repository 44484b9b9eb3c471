//! Cryptographic contracts consumed by the packet foot (signature) and
//! coat (box/encryption) layers.
//!
//! Per spec §1 the primitives themselves are an external collaborator: this
//! module fixes the trait surface the engine is written against plus a
//! non-cryptographic [`mock`] implementation used by tests.

use crate::error::{Error, PacketError, Result};

/// A signing keypair used to produce and verify the packet foot when
/// `fk == FootKind::NaclSig`.
pub trait Signer {
    /// Produces a detached signature over `data`.
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    /// Hex-encoded public verify key, used by [`crate::keep`] safe records.
    fn verify_key_hex(&self) -> String;
}

/// The peer-facing half of [`Signer`]: verifies a foot against a known
/// verify key.
pub trait Verifier {
    /// Returns `Ok(())` if `sig` is a valid signature of `data` under this
    /// verify key, or a [`PacketError`] otherwise.
    fn verify(&self, data: &[u8], sig: &[u8]) -> Result<()>;
    /// Hex-encoded verify key.
    fn to_hex(&self) -> String;
}

/// A box (authenticated-encryption) keypair used for the packet coat when
/// `ck == CoatKind::NaclBox`.
pub trait Boxer {
    /// Encrypts `plaintext` for `their_public_key_hex`.
    fn seal(&self, plaintext: &[u8], their_public_key_hex: &str) -> Vec<u8>;
    /// Decrypts `ciphertext` sent by `their_public_key_hex`.
    fn open(&self, ciphertext: &[u8], their_public_key_hex: &str) -> Result<Vec<u8>>;
    /// Hex-encoded public box key, used by [`crate::keep`] safe records.
    fn public_key_hex(&self) -> String;
}

/// Bundles a [`Signer`] + [`Boxer`] pair, which is what a local estate
/// actually owns; remotes only hold the verifying/public halves.
pub trait KeyMaterial: Signer + Boxer {}
impl<T: Signer + Boxer> KeyMaterial for T {}

/// Reconstructs a remote's [`Verifier`] from its persisted hex-encoded
/// verify key. Kept as its own trait because this step is backend
/// specific (a real implementation parses key bytes; the mock backend
/// below just reverses its own encoding).
pub trait KeyFactory {
    /// Builds a verifier for the peer whose verify key is `hex`.
    fn verifier_for_hex(&self, hex: &str) -> Box<dyn Verifier>;
}

/// Non-cryptographic reference implementation of the key-material
/// contract, used by unit tests and the scenario suite. Signatures are a
/// fixed-width digest and boxing is a reversible XOR keystream derived from
/// the key hex — enough to exercise success/failure branches without
/// pulling in a real crypto dependency for code that is explicitly out of
/// scope (see spec §1).
pub mod mock {
    use super::*;

    /// A deterministic stand-in keypair identified by a name.
    #[derive(Debug, Clone)]
    pub struct MockKeyPair {
        id: String,
    }

    impl MockKeyPair {
        /// Creates a keypair identified by `id`. Two keypairs created with
        /// the same id behave identically (same keys), which is how tests
        /// simulate "the remote's actual key material".
        pub fn new(id: impl Into<String>) -> Self {
            Self { id: id.into() }
        }

        fn digest(&self, data: &[u8]) -> Vec<u8> {
            let mut acc: u64 = 0xcbf29ce484222325;
            for b in self.id.as_bytes().iter().chain(data.iter()) {
                acc ^= *b as u64;
                acc = acc.wrapping_mul(0x100000001b3);
            }
            acc.to_le_bytes().to_vec()
        }

        fn keystream(key_hex: &str, len: usize) -> Vec<u8> {
            let seed = key_hex.as_bytes();
            (0..len)
                .map(|i| seed[i % seed.len().max(1)])
                .collect()
        }

        /// Order-independent combination of both peers' public key hex, so
        /// sealing with (self, their_hex) and opening with (them, self_hex)
        /// land on the same stream.
        fn shared_seed(&self, their_public_key_hex: &str) -> String {
            let mine = self.public_key_hex();
            if mine.as_str() <= their_public_key_hex {
                format!("{mine}:{their_public_key_hex}")
            } else {
                format!("{their_public_key_hex}:{mine}")
            }
        }
    }

    impl Signer for MockKeyPair {
        fn sign(&self, data: &[u8]) -> Vec<u8> {
            self.digest(data)
        }

        fn verify_key_hex(&self) -> String {
            hex::encode(self.id.as_bytes())
        }
    }

    impl Verifier for MockKeyPair {
        fn verify(&self, data: &[u8], sig: &[u8]) -> Result<()> {
            if self.digest(data) == sig {
                Ok(())
            } else {
                Err(Error::Packet(PacketError::new("signature verification failed")))
            }
        }

        fn to_hex(&self) -> String {
            self.verify_key_hex()
        }
    }

    impl Boxer for MockKeyPair {
        fn seal(&self, plaintext: &[u8], their_public_key_hex: &str) -> Vec<u8> {
            let ks = Self::keystream(&self.shared_seed(their_public_key_hex), plaintext.len());
            plaintext.iter().zip(ks.iter()).map(|(a, b)| a ^ b).collect()
        }

        fn open(&self, ciphertext: &[u8], their_public_key_hex: &str) -> Result<Vec<u8>> {
            // XOR is its own inverse given the same keystream.
            Ok(self.seal(ciphertext, their_public_key_hex))
        }

        fn public_key_hex(&self) -> String {
            hex::encode(self.id.as_bytes())
        }
    }

    /// Builds a fresh verify-key hex for `id` without constructing a full
    /// keypair, for use when only the peer-facing half is needed.
    pub fn verify_key_hex_for(id: &str) -> String {
        MockKeyPair::new(id).verify_key_hex()
    }

    /// Reverses [`MockKeyPair::verify_key_hex`] back into the id it was
    /// built from.
    fn id_from_hex(hex: &str) -> String {
        hex::decode(hex)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    /// A [`KeyFactory`] for [`MockKeyPair`]s, reversing the id-as-hex
    /// encoding used by [`MockKeyPair::verify_key_hex`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MockKeyFactory;

    impl super::KeyFactory for MockKeyFactory {
        fn verifier_for_hex(&self, hex: &str) -> Box<dyn Verifier> {
            Box::new(MockKeyPair::new(id_from_hex(hex)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockKeyPair;
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let alice = MockKeyPair::new("alice");
        let data = b"hello estate";
        let sig = alice.sign(data);
        assert!(alice.verify(data, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let alice = MockKeyPair::new("alice");
        let sig = alice.sign(b"hello estate");
        assert!(alice.verify(b"goodbye estate", &sig).is_err());
    }

    #[test]
    fn seal_then_open_round_trips() {
        let alice = MockKeyPair::new("alice");
        let bob = MockKeyPair::new("bob");
        let plaintext = b"session payload";
        let sealed = alice.seal(plaintext, &bob.public_key_hex());
        let opened = bob.open(&sealed, &alice.public_key_hex()).unwrap();
        assert_eq!(opened, plaintext);
    }
}
