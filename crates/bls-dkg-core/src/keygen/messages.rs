//! DKG message types

use crate::curve::{self, PUBLIC_KEY_LEN, SCALAR_LEN};
use crate::proof::DlogProof;
use crate::vss::{BLIND_FACTOR_LEN, COMMITMENT_LEN};
use crate::{Error, PartyIndex, Result, SessionId};
use bls12_381::{G1Affine, Scalar};
use serde::{Deserialize, Serialize};

/// Protocol message as handed to and received from the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgMessage {
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Sender party index
    pub sender: PartyIndex,
    /// Recipient of a direct message; `None` for broadcasts
    #[serde(default)]
    pub to: Option<PartyIndex>,
    /// Round tag (1..=4)
    pub round: u8,
    /// Round payload
    pub body: DkgMessageBody,
}

/// Per-round payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgMessageBody {
    /// Commitment digest over the sender's Feldman commitments
    Round1 { commitment: [u8; COMMITMENT_LEN] },

    /// Reveal of the committed values
    Round2 {
        decommitment: Vec<Vec<u8>>,
        blind_factor: [u8; BLIND_FACTOR_LEN],
        /// Sender's contribution to the group key
        yi: Option<Vec<u8>>,
    },

    /// Feldman commitments and one slot per committee member, in committee
    /// order. Sent point-to-point; only the recipient's slot holds a share.
    Round3 {
        commitments: Vec<Vec<u8>>,
        shares: Vec<Option<Vec<u8>>>,
    },

    /// Proof of knowledge of the sender's final secret share
    Round4 { proof: DlogProof },
}

impl DkgMessageBody {
    /// Round this payload belongs to
    pub fn round(&self) -> u8 {
        match self {
            DkgMessageBody::Round1 { .. } => 1,
            DkgMessageBody::Round2 { .. } => 2,
            DkgMessageBody::Round3 { .. } => 3,
            DkgMessageBody::Round4 { .. } => 4,
        }
    }
}

impl DkgMessage {
    /// Wrap a broadcast payload, tagging it with its round
    pub fn new(session_id: SessionId, sender: PartyIndex, body: DkgMessageBody) -> Self {
        Self {
            session_id,
            sender,
            to: None,
            round: body.round(),
            body,
        }
    }

    /// Wrap a payload meant for `to` only
    pub fn direct(
        session_id: SessionId,
        sender: PartyIndex,
        to: PartyIndex,
        body: DkgMessageBody,
    ) -> Self {
        Self {
            to: Some(to),
            ..Self::new(session_id, sender, body)
        }
    }

    /// Declared round number
    pub fn round(&self) -> u8 {
        self.round
    }

    /// Sender of this message
    pub fn sender(&self) -> PartyIndex {
        self.sender
    }

    /// Recipient, for direct messages
    pub fn recipient(&self) -> Option<PartyIndex> {
        self.to
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Round1 {
    pub commitment: [u8; COMMITMENT_LEN],
}

#[derive(Debug, Clone)]
pub(crate) struct Round2 {
    pub decommitment: Vec<G1Affine>,
    pub blind_factor: [u8; BLIND_FACTOR_LEN],
    pub yi: Option<G1Affine>,
}

#[derive(Debug, Clone)]
pub(crate) struct Round3 {
    pub commitments: Vec<G1Affine>,
    pub shares: Vec<Option<Scalar>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Round4 {
    pub proof: DlogProof,
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Round1(Round1),
    Round2(Round2),
    Round3(Round3),
    Round4(Round4),
}

/// A message that passed structural validation
#[derive(Debug, Clone)]
pub(crate) struct ParsedMessage {
    pub sender: PartyIndex,
    pub payload: Payload,
}

impl ParsedMessage {
    /// Decode the wire payload into typed points and scalars.
    ///
    /// Only checks structure: lengths, point and scalar encodings, and that
    /// the body matches the round tag. Cryptographic checks happen in the
    /// round gates.
    pub fn parse(message: DkgMessage) -> Result<Self> {
        let round = message.round;
        let sender = message.sender;
        if !(1..=4).contains(&round) {
            return Err(Error::UnknownRound { round, sender });
        }
        let malformed = |reason| Error::MalformedMessage {
            round,
            sender,
            reason,
        };
        if message.body.round() != round {
            return Err(malformed("payload does not match round tag"));
        }

        let payload = match message.body {
            DkgMessageBody::Round1 { commitment } => Payload::Round1(Round1 { commitment }),
            DkgMessageBody::Round2 {
                decommitment,
                blind_factor,
                yi,
            } => {
                if decommitment.is_empty() {
                    return Err(malformed("empty decommitment"));
                }
                let decommitment = decode_points(&decommitment)
                    .ok_or_else(|| malformed("invalid decommitment point"))?;
                let yi = match yi {
                    Some(bytes) => Some(
                        curve::decode_point(&bytes).ok_or_else(|| malformed("invalid YI point"))?,
                    ),
                    None => None,
                };
                Payload::Round2(Round2 {
                    decommitment,
                    blind_factor,
                    yi,
                })
            }
            DkgMessageBody::Round3 {
                commitments,
                shares,
            } => {
                if commitments.is_empty() || shares.is_empty() {
                    return Err(malformed("empty commitments or shares"));
                }
                let commitments = decode_points(&commitments)
                    .ok_or_else(|| malformed("invalid commitment point"))?;
                if message.to.is_none() {
                    return Err(malformed("deal is not addressed"));
                }
                let shares = shares
                    .iter()
                    .map(|slot| match slot {
                        Some(bytes) => curve::decode_scalar(bytes).map(Some),
                        None => Some(None),
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| malformed("invalid share encoding"))?;
                Payload::Round3(Round3 {
                    commitments,
                    shares,
                })
            }
            DkgMessageBody::Round4 { proof } => {
                if proof.commitment.len() != PUBLIC_KEY_LEN
                    || proof.public_key.len() != PUBLIC_KEY_LEN
                    || proof.response.len() != SCALAR_LEN
                {
                    return Err(malformed("proof component has wrong length"));
                }
                Payload::Round4(Round4 { proof })
            }
        };

        Ok(Self { sender, payload })
    }
}

impl ParsedMessage {
    /// True unless this is a deal with a share outside `position`.
    pub fn holds_only_slot(&self, position: usize) -> bool {
        match &self.payload {
            Payload::Round3(deal) => deal
                .shares
                .iter()
                .enumerate()
                .all(|(i, slot)| i == position || slot.is_none()),
            _ => true,
        }
    }
}

fn decode_points(encoded: &[Vec<u8>]) -> Option<Vec<G1Affine>> {
    encoded
        .iter()
        .map(|bytes| curve::decode_point(bytes))
        .collect()
}

pub(crate) fn encode_points(points: &[G1Affine]) -> Vec<Vec<u8>> {
    points.iter().map(|p| p.to_compressed().to_vec()).collect()
}
