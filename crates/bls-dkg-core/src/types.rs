//! Core types for the DKG protocol

use crate::curve;
use crate::{Error, Result};
use bls12_381::{G1Affine, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 1-based index of a party in the committee
pub type PartyIndex = u32;

/// Unique identifier for a DKG run
pub type SessionId = [u8; 32];

/// Configuration for a DKG session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session identifier
    pub session_id: SessionId,

    /// This party's index
    pub party_index: PartyIndex,

    /// Polynomial degree; up to `threshold` parties may be corrupt or absent
    pub threshold: usize,

    /// Ordered committee of party indices
    pub committee: Vec<PartyIndex>,
}

impl SessionConfig {
    /// Create and validate a session configuration
    pub fn new(
        session_id: SessionId,
        party_index: PartyIndex,
        threshold: usize,
        committee: Vec<PartyIndex>,
    ) -> Result<Self> {
        let config = Self {
            session_id,
            party_index,
            threshold,
            committee,
        };
        config.validate()?;
        Ok(config)
    }

    /// Committee of `1..=n`
    pub fn sequential(
        session_id: SessionId,
        party_index: PartyIndex,
        threshold: usize,
        n_parties: u32,
    ) -> Result<Self> {
        Self::new(session_id, party_index, threshold, (1..=n_parties).collect())
    }

    /// Number of parties
    pub fn n_parties(&self) -> usize {
        self.committee.len()
    }

    /// Check committee and threshold constraints
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.committee.len());
        for &index in &self.committee {
            if index == 0 {
                return Err(Error::ZeroPartyIndex);
            }
            if !seen.insert(index) {
                return Err(Error::DuplicatePartyIndex(index));
            }
        }

        if !seen.contains(&self.party_index) {
            return Err(Error::PartyNotInCommittee(self.party_index));
        }

        if self.threshold == 0 || self.threshold >= self.committee.len() {
            return Err(Error::InvalidThreshold {
                threshold: self.threshold,
                parties: self.committee.len(),
            });
        }

        Ok(())
    }
}

/// Key material held by a party once the DKG completes
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DkgOutput {
    /// Session this share was generated in
    pub session_id: SessionId,

    /// This party's index
    pub party_index: PartyIndex,

    /// Threshold the group key was shared under
    pub threshold: usize,

    /// Committee that generated the key
    pub committee: Vec<PartyIndex>,

    /// Aggregated group public key (compressed G1)
    pub group_public_key: Vec<u8>,

    /// This party's final secret share (little-endian scalar)
    pub secret_share: [u8; 32],

    /// Public key share of every committee member
    #[zeroize(skip)]
    pub public_shares: BTreeMap<PartyIndex, Vec<u8>>,
}

impl std::fmt::Debug for DkgOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkgOutput")
            .field("session_id", &hex::encode(self.session_id))
            .field("party_index", &self.party_index)
            .field("threshold", &self.threshold)
            .field("committee", &self.committee)
            .field("group_public_key", &self.group_public_key_hex())
            .field("secret_share", &"<redacted>")
            .finish()
    }
}

impl DkgOutput {
    /// Decode the secret share
    pub fn secret_scalar(&self) -> Option<Scalar> {
        curve::decode_scalar(&self.secret_share)
    }

    /// Decode the group public key
    pub fn group_public_key_point(&self) -> Option<G1Affine> {
        curve::decode_point(&self.group_public_key)
    }

    /// Group public key as hex
    pub fn group_public_key_hex(&self) -> String {
        hex::encode(&self.group_public_key)
    }
}
