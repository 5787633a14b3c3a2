//! Non-interactive proof of knowledge of a discrete logarithm
//!
//! Schnorr's protocol made non-interactive with a Fiat–Shamir challenge:
//! the prover publishes `P = x·G`, `R = r·G` and `z = r + c·x` where
//! `c = H(session, prover, R, P)`. The verifier checks `z·G == R + c·P`.
//! Binding the challenge to the session and the prover's index stops a
//! proof from being replayed in another run or by another party.

use crate::curve;
use crate::{PartyIndex, SessionId};
use bls12_381::{G1Projective, Scalar};
use ff::Field;
use merlin::Transcript;
use serde::{Deserialize, Serialize};

const TRANSCRIPT_LABEL: &[u8] = b"bls-dkg/dlog-proof/v1";

/// Values the challenge is bound to besides the proof itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofContext {
    /// Session identifier
    pub session_id: SessionId,
    /// Index of the proving party
    pub prover: PartyIndex,
}

impl ProofContext {
    pub fn new(session_id: SessionId, prover: PartyIndex) -> Self {
        Self { session_id, prover }
    }
}

/// Proof that the sender knows the secret behind `public_key`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlogProof {
    /// Compressed nonce commitment `R`
    pub commitment: Vec<u8>,
    /// Compressed public key `P`
    pub public_key: Vec<u8>,
    /// Response scalar `z`
    pub response: Vec<u8>,
}

impl DlogProof {
    /// Prove knowledge of `secret` using `nonce`.
    ///
    /// Returns `None` if either scalar is zero; a zero nonce would reveal
    /// the secret and a zero secret proves nothing.
    pub fn prove(secret: &Scalar, nonce: &Scalar, context: &ProofContext) -> Option<Self> {
        if bool::from(secret.is_zero()) || bool::from(nonce.is_zero()) {
            return None;
        }

        let public_key = curve::encode_point(&curve::public_key(secret));
        let commitment = curve::encode_point(&curve::public_key(nonce));
        let challenge = challenge(context, &commitment, &public_key);
        let response = *nonce + challenge * secret;

        Some(Self {
            commitment: commitment.to_vec(),
            public_key: public_key.to_vec(),
            response: curve::encode_scalar(&response).to_vec(),
        })
    }

    /// Verify the proof. Malformed components make it fail rather than error.
    pub fn verify(&self, context: &ProofContext) -> bool {
        let (Some(commitment), Some(public_key), Some(response)) = (
            curve::decode_point(&self.commitment),
            curve::decode_point(&self.public_key),
            curve::decode_scalar(&self.response),
        ) else {
            return false;
        };

        if bool::from(public_key.is_identity()) {
            return false;
        }

        let challenge = challenge(context, &self.commitment, &self.public_key);
        let lhs = curve::public_key(&response);
        let rhs = G1Projective::from(commitment) + G1Projective::from(public_key) * challenge;
        lhs == rhs
    }
}

fn challenge(context: &ProofContext, commitment: &[u8], public_key: &[u8]) -> Scalar {
    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
    transcript.append_message(b"session_id", &context.session_id);
    transcript.append_message(b"prover", &context.prover.to_be_bytes());
    transcript.append_message(b"commitment", commitment);
    transcript.append_message(b"public_key", public_key);

    let mut wide = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut wide);
    curve::scalar_from_wide(&wide)
}
