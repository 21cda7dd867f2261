//! Asymmetric identities of master and imp.
//!
//! Keys are OpenSSH keys (RSA, DSA, ECDSA, Ed25519) handled through `ssh-key`.
//! Public keys travel in OpenSSH text form and signatures as SSHSIG PEM blocks.

use rand::RngCore;
use ring::hmac;
use ssh_key::public::KeyData;
use ssh_key::{EcdsaCurve, HashAlg, LineEnding, Mpint, SshSig};

pub use ssh_key::{PrivateKey, PublicKey};

use crate::error::{ImpError, ImpResult};

/// SSHSIG namespace for every signature of the handshake.
pub const SIGNATURE_NAMESPACE: &str = "bifroest-imp";

/// Algorithm and strength of a public key, as seen by a restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrength {
    Rsa { bits: u32 },
    Dsa { bits: u32 },
    Ecdsa { bits: u32 },
    Ed25519,
    Other,
}

/// Determine algorithm and bit size of a public key.
pub fn key_strength(key: &PublicKey) -> KeyStrength {
    match key.key_data() {
        KeyData::Rsa(rsa) => KeyStrength::Rsa {
            bits: mpint_bits(&rsa.n),
        },
        KeyData::Dsa(dsa) => KeyStrength::Dsa {
            bits: mpint_bits(&dsa.p),
        },
        KeyData::Ecdsa(ecdsa) => KeyStrength::Ecdsa {
            bits: match ecdsa.curve() {
                EcdsaCurve::NistP256 => 256,
                EcdsaCurve::NistP384 => 384,
                EcdsaCurve::NistP521 => 521,
            },
        },
        KeyData::Ed25519(_) => KeyStrength::Ed25519,
        _ => KeyStrength::Other,
    }
}

/// Number of significant bits of a positive multi-precision integer.
fn mpint_bits(value: &Mpint) -> u32 {
    match value.as_positive_bytes() {
        Some([first, rest @ ..]) => rest.len() as u32 * 8 + (8 - first.leading_zeros()),
        _ => 0,
    }
}

/// SHA-256 fingerprint in OpenSSH notation (`SHA256:...`).
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Encode a public key in OpenSSH single-line form.
pub fn encode_public_key(key: &PublicKey) -> ImpResult<String> {
    Ok(key.to_openssh()?)
}

/// Parse a public key from OpenSSH single-line form.
pub fn decode_public_key(text: &str) -> ImpResult<PublicKey> {
    PublicKey::from_openssh(text.trim())
        .map_err(|e| ImpError::Format(format!("illegal public key: {e}")))
}

/// Compare two public keys without leaking where they differ.
pub fn same_public_key(a: &PublicKey, b: &PublicKey) -> bool {
    let (Ok(a), Ok(b)) = (a.to_bytes(), b.to_bytes()) else {
        return false;
    };
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
    let tag = hmac::sign(&key, &a);
    hmac::verify(&key, &b, tag.as_ref()).is_ok()
}

/// Sign `message` and return the SSHSIG PEM block.
pub fn sign(key: &PrivateKey, message: &[u8]) -> ImpResult<String> {
    let signature = key.sign(SIGNATURE_NAMESPACE, HashAlg::Sha512, message)?;
    Ok(signature.to_pem(LineEnding::LF)?)
}

/// Verify an SSHSIG PEM block over `message` against `key`.
pub fn verify(key: &PublicKey, message: &[u8], signature: &str) -> ImpResult<()> {
    let signature = SshSig::from_pem(signature)
        .map_err(|e| ImpError::AuthenticationFailed(format!("malformed signature: {e}")))?;
    key.verify(SIGNATURE_NAMESPACE, message, &signature)
        .map_err(|_| ImpError::AuthenticationFailed("signature verification failed".into()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ssh_key::public::{DsaPublicKey, RsaPublicKey};
    use ssh_key::Algorithm;

    /// An RSA public key whose modulus has exactly `bits` significant bits.
    pub(crate) fn rsa_public_key(bits: u32) -> PublicKey {
        PublicKey::from(KeyData::Rsa(RsaPublicKey {
            e: Mpint::from_positive_bytes(&[0x01, 0x00, 0x01]).unwrap(),
            n: Mpint::from_positive_bytes(&top_bit_number(bits)).unwrap(),
        }))
    }

    /// A DSA public key whose prime `p` has exactly `bits` significant bits.
    pub(crate) fn dsa_public_key(bits: u32) -> PublicKey {
        let small = Mpint::from_positive_bytes(&[0x05]).unwrap();
        PublicKey::from(KeyData::Dsa(DsaPublicKey {
            p: Mpint::from_positive_bytes(&top_bit_number(bits)).unwrap(),
            q: small.clone(),
            g: small.clone(),
            y: small,
        }))
    }

    fn top_bit_number(bits: u32) -> Vec<u8> {
        let len = bits.div_ceil(8) as usize;
        let mut bytes = vec![0xffu8; len];
        let used = bits - (len as u32 - 1) * 8;
        bytes[0] = 1u8 << (used - 1);
        bytes
    }

    pub(crate) fn ed25519_key() -> PrivateKey {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn rsa_bits_are_counted_exactly() {
        assert_eq!(
            key_strength(&rsa_public_key(4096)),
            KeyStrength::Rsa { bits: 4096 }
        );
        assert_eq!(
            key_strength(&rsa_public_key(4095)),
            KeyStrength::Rsa { bits: 4095 }
        );
        assert_eq!(
            key_strength(&dsa_public_key(1023)),
            KeyStrength::Dsa { bits: 1023 }
        );
    }

    #[test]
    fn ed25519_strength() {
        let key = ed25519_key();
        assert_eq!(key_strength(key.public_key()), KeyStrength::Ed25519);
    }

    #[test]
    fn sign_and_verify() {
        let key = ed25519_key();
        let sig = sign(&key, b"transcript").unwrap();
        assert!(verify(key.public_key(), b"transcript", &sig).is_ok());
        assert!(matches!(
            verify(key.public_key(), b"other transcript", &sig),
            Err(ImpError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn public_key_text_form() {
        let key = ed25519_key();
        let text = encode_public_key(key.public_key()).unwrap();
        assert!(text.starts_with("ssh-ed25519 "));
        let parsed = decode_public_key(&format!("  {text}\n")).unwrap();
        assert!(same_public_key(&parsed, key.public_key()));
        assert!(!same_public_key(&parsed, ed25519_key().public_key()));
        assert!(fingerprint(&parsed).starts_with("SHA256:"));
    }
}
