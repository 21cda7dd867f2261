//! Mutual authentication of master and imp.
//!
//! Runs before the multiplexer starts, inside the TLS session set up by
//! [`crate::tls`]:
//!
//! ```text
//! master                                   imp
//!   ── Hello{session_id, nonce_m, key_m, token_proof} ──▶
//!   ◀── Challenge{key_i, nonce_i, sig_i(transcript "imp")} ──
//!   ── Proof{sig_m(transcript "master")} ──▶
//!   ◀── Verdict{accepted, reason} ──
//! ```
//!
//! Both signatures cover `SHA-256("bifroest-imp-v1\0" || role || session_id ||
//! nonce_m || nonce_i || binding)`, where `binding` is the TLS exporter value.
//! A signature cannot be replayed for another session, for the opposite role,
//! or on another TLS connection. The token proof is bound the same way.

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::codec::{read_frame, write_frame};
use crate::error::{ImpError, ImpResult};
use crate::identity::{
    decode_public_key, encode_public_key, fingerprint, same_public_key, sign, verify, PrivateKey,
    PublicKey,
};
use crate::ids::SessionId;
use crate::messages::{Challenge, Hello, Proof, Verdict, PROTOCOL_VERSION};
use crate::restriction::Restriction;
use crate::tls::{self, ChannelBinding};
use crate::token::AccessToken;
use crate::transport::Transport;

/// Length of the random nonces.
pub const NONCE_LEN: usize = 32;

const TRANSCRIPT_DOMAIN: &[u8] = b"bifroest-imp-v1\0";

fn transcript(
    role: &str,
    session_id: &SessionId,
    master_nonce: &[u8],
    imp_nonce: &[u8],
    binding: &ChannelBinding,
) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(TRANSCRIPT_DOMAIN);
    h.update(role.as_bytes());
    h.update(session_id.as_bytes());
    h.update(master_nonce);
    h.update(imp_nonce);
    h.update(binding);
    h.finalize().to_vec()
}

/// What the access token proof covers.
fn token_challenge(master_nonce: &[u8], binding: &ChannelBinding) -> Vec<u8> {
    [master_nonce, binding.as_slice()].concat()
}

fn nonce() -> Vec<u8> {
    let mut n = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut n);
    n
}

// ── Master side ──────────────────────────────────────────────────────

/// Parameters of the master's side of the handshake.
#[derive(Debug, Clone, Copy)]
pub struct MasterHandshake<'a> {
    pub session_id: SessionId,
    /// `None` runs the master unauthenticated.
    pub key: Option<&'a PrivateKey>,
    /// The imp key to insist on; `None` accepts any key passing `restriction`.
    pub expected_imp: Option<&'a PublicKey>,
    pub restriction: &'a Restriction,
    pub token: Option<&'a AccessToken>,
}

/// Secure `transport` and authenticate towards an imp.
///
/// Returns the encrypted transport and the imp's verified public key.
pub async fn initiate(
    transport: Transport,
    params: MasterHandshake<'_>,
) -> ImpResult<(Transport, PublicKey)> {
    let (mut transport, binding) = tls::connect(transport).await?;
    let stream = &mut transport;
    let master_nonce = nonce();
    let hello = Hello {
        version: PROTOCOL_VERSION,
        session_id: params.session_id,
        nonce: master_nonce.clone(),
        master_key: params
            .key
            .map(|k| encode_public_key(k.public_key()))
            .transpose()?,
        token_proof: params
            .token
            .map(|t| t.proof(&params.session_id, &token_challenge(&master_nonce, &binding))),
    };
    write_frame(stream, &hello).await?;

    let challenge: Challenge = read_frame(stream).await?;
    if challenge.nonce.len() != NONCE_LEN {
        return Err(ImpError::Protocol("imp nonce has wrong length".into()));
    }
    let imp_key = decode_public_key(&challenge.imp_key)?;
    match params.expected_imp {
        Some(expected) if !same_public_key(expected, &imp_key) => {
            return Err(ImpError::AuthenticationFailed(format!(
                "imp presented key {} but {} was expected",
                fingerprint(&imp_key),
                fingerprint(expected)
            )));
        }
        Some(_) => {}
        None => warn!(
            fingerprint = %fingerprint(&imp_key),
            "no expected imp key configured; accepting any key allowed by restriction"
        ),
    }
    params.restriction.check(&imp_key)?;
    let imp_transcript = transcript(
        "imp",
        &params.session_id,
        &master_nonce,
        &challenge.nonce,
        &binding,
    );
    verify(&imp_key, &imp_transcript, &challenge.signature)?;

    let master_transcript = transcript(
        "master",
        &params.session_id,
        &master_nonce,
        &challenge.nonce,
        &binding,
    );
    let proof = Proof {
        signature: params
            .key
            .map(|k| sign(k, &master_transcript))
            .transpose()?,
    };
    write_frame(stream, &proof).await?;

    let verdict: Verdict = read_frame(stream).await?;
    if !verdict.accepted {
        return Err(ImpError::AuthenticationFailed(
            verdict
                .reason
                .unwrap_or_else(|| "rejected by imp".to_string()),
        ));
    }
    debug!(session_id = %params.session_id, imp = %fingerprint(&imp_key), "handshake complete");
    Ok((transport, imp_key))
}

// ── Imp side ─────────────────────────────────────────────────────────

/// Parameters of the imp's side of the handshake.
#[derive(Debug, Clone, Copy)]
pub struct ImpHandshake<'a> {
    pub key: &'a PrivateKey,
    /// The only master key accepted. `None` requires `allow_unauthenticated`.
    pub trust_anchor: Option<&'a PublicKey>,
    pub restriction: &'a Restriction,
    pub token: Option<&'a AccessToken>,
    pub allow_unauthenticated: bool,
}

/// Result of a successful handshake on the imp side.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub session_id: SessionId,
    /// `None` when the master ran unauthenticated.
    pub master_key: Option<PublicKey>,
}

/// Secure `transport` and authenticate an incoming master.
///
/// A rejected master is told why in the final verdict and the call fails with
/// `AuthenticationFailed`.
pub async fn respond(
    transport: Transport,
    params: ImpHandshake<'_>,
) -> ImpResult<(Transport, Accepted)> {
    let (mut transport, binding) = tls::accept(transport).await?;
    let stream = &mut transport;
    let hello: Hello = read_frame(stream).await?;
    let imp_nonce = nonce();

    let mut rejection = check_hello(&hello, &binding, &params).err();
    let mut master_key = None;
    if let (true, Some(text)) = (rejection.is_none(), &hello.master_key) {
        match decode_public_key(text) {
            Ok(key) => master_key = Some(key),
            Err(e) => rejection = Some(e.to_string()),
        }
    }
    if rejection.is_none() {
        rejection = check_master_key(master_key.as_ref(), &params).err();
    }

    let imp_transcript = transcript("imp", &hello.session_id, &hello.nonce, &imp_nonce, &binding);
    let challenge = Challenge {
        imp_key: encode_public_key(params.key.public_key())?,
        nonce: imp_nonce.clone(),
        signature: sign(params.key, &imp_transcript)?,
    };
    write_frame(stream, &challenge).await?;

    let proof: Proof = read_frame(stream).await?;
    if rejection.is_none() {
        if let Some(key) = &master_key {
            let master_transcript =
                transcript("master", &hello.session_id, &hello.nonce, &imp_nonce, &binding);
            rejection = match &proof.signature {
                Some(sig) => verify(key, &master_transcript, sig).err().map(|e| e.to_string()),
                None => Some("master did not prove its key".to_string()),
            };
        }
    }

    let verdict = Verdict {
        accepted: rejection.is_none(),
        reason: rejection.clone(),
    };
    write_frame(stream, &verdict).await?;

    if let Some(reason) = rejection {
        return Err(ImpError::AuthenticationFailed(reason));
    }
    if master_key.is_none() {
        warn!(session_id = %hello.session_id, "accepted unauthenticated master");
    }
    let accepted = Accepted {
        session_id: hello.session_id,
        master_key,
    };
    Ok((transport, accepted))
}

fn check_hello(
    hello: &Hello,
    binding: &ChannelBinding,
    params: &ImpHandshake<'_>,
) -> Result<(), String> {
    if hello.version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {} is not supported (expected {PROTOCOL_VERSION})",
            hello.version
        ));
    }
    if hello.nonce.len() != NONCE_LEN {
        return Err("master nonce has wrong length".into());
    }
    if let Some(token) = params.token {
        let proof = hello
            .token_proof
            .as_deref()
            .ok_or_else(|| "access token required".to_string())?;
        token
            .verify(&hello.session_id, &token_challenge(&hello.nonce, binding), proof)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn check_master_key(key: Option<&PublicKey>, params: &ImpHandshake<'_>) -> Result<(), String> {
    match (params.trust_anchor, key) {
        (Some(anchor), Some(key)) => {
            if !same_public_key(anchor, key) {
                return Err(format!("master key {} is not trusted", fingerprint(key)));
            }
            params.restriction.check(key).map_err(|e| e.to_string())
        }
        (Some(_), None) => Err("master key required".into()),
        (None, _) if params.allow_unauthenticated => Ok(()),
        (None, _) => Err("imp has no trust anchor configured".into()),
    }
}
