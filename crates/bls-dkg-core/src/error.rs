//! Error types for DKG sessions

use crate::PartyIndex;
use thiserror::Error;

/// Result type alias for DKG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or driving a DKG session.
///
/// The variants fall into four groups that callers must treat differently:
/// construction errors (no session is produced), message-admission errors
/// (the single message is dropped, the session is untouched), retryable
/// conditions ([`Error::NotReady`], [`Error::OutboxBusy`]) and round-fatal
/// errors that name the offending sender so the driver can exclude it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Committee contains the reserved index zero
    #[error("Committee contains party index 0")]
    ZeroPartyIndex,

    /// Committee lists the same index twice
    #[error("Duplicate party index {0} in committee")]
    DuplicatePartyIndex(PartyIndex),

    /// This party's own index is absent from the committee
    #[error("Party {0} is not a committee member")]
    PartyNotInCommittee(PartyIndex),

    /// Threshold outside `1..n`
    #[error("Invalid threshold {threshold} for {parties} parties")]
    InvalidThreshold { threshold: usize, parties: usize },

    /// [`crate::curve::init`] has not been called yet
    #[error("Curve backend not initialized")]
    NotInitialized,

    /// Curve backend self-check failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Message belongs to a different DKG run
    #[error("Message from party {sender} belongs to another session")]
    SessionMismatch { sender: PartyIndex },

    /// Message sender is not a committee member
    #[error("Unknown sender {0}")]
    UnknownSender(PartyIndex),

    /// Incoming message carries a round tag outside `1..=4`
    #[error("Message from party {sender} has unknown round tag {round}")]
    UnknownRound { round: u8, sender: PartyIndex },

    /// Direct message addressed to another party
    #[error("Message from party {sender} is addressed to party {to}")]
    Misaddressed { sender: PartyIndex, to: PartyIndex },

    /// Session state holds a round number the dispatcher does not know
    #[error("Invalid round {0}")]
    InvalidRound(u8),

    /// Message payload does not structurally match its round
    #[error("Malformed round {round} message from party {sender}: {reason}")]
    MalformedMessage {
        round: u8,
        sender: PartyIndex,
        reason: &'static str,
    },

    /// Not every committee member has delivered this round's input yet
    #[error("Round {round} waiting on parties {missing:?}")]
    NotReady { round: u8, missing: Vec<PartyIndex> },

    /// Outbox is being drained concurrently
    #[error("Outbox busy, try again")]
    OutboxBusy,

    /// Round 2 reveal does not hash back to the round 1 commitment
    #[error("Round {round}: decommitment from party {sender} does not match its commitment")]
    CommitmentMismatch { round: u8, sender: PartyIndex },

    /// Wrong number of Feldman commitments
    #[error("Round {round}: party {sender} sent {actual} commitments, expected {expected}")]
    CommitmentCount {
        round: u8,
        sender: PartyIndex,
        expected: usize,
        actual: usize,
    },

    /// Wrong number of secret shares
    #[error("Round {round}: party {sender} sent {actual} shares, expected {expected}")]
    ShareCount {
        round: u8,
        sender: PartyIndex,
        expected: usize,
        actual: usize,
    },

    /// Revealed values disagree with the dealt commitments
    #[error("Round {round}: public value from party {sender} does not match its commitments")]
    PublicValueMismatch { round: u8, sender: PartyIndex },

    /// Share does not lie on the dealer's committed polynomial
    #[error("Round {round}: share from party {sender} failed verification")]
    InvalidShare { round: u8, sender: PartyIndex },

    /// Knowledge proof failed to verify
    #[error("Round {round}: knowledge proof from party {sender} failed verification")]
    InvalidProof { round: u8, sender: PartyIndex },

    /// Declared public key is not the public share implied by the commitments
    #[error("Round {round}: public key from party {sender} does not match its public share")]
    PublicShareMismatch { round: u8, sender: PartyIndex },

    /// Output already produced
    #[error("Session already complete")]
    SessionComplete,
}

impl Error {
    /// Whether the caller should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady { .. } | Error::OutboxBusy)
    }

    /// Whether the session must be abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CommitmentMismatch { .. }
                | Error::CommitmentCount { .. }
                | Error::ShareCount { .. }
                | Error::PublicValueMismatch { .. }
                | Error::InvalidShare { .. }
                | Error::InvalidProof { .. }
                | Error::PublicShareMismatch { .. }
                | Error::InvalidRound(_)
        )
    }

    /// The party whose message caused this error, when known.
    pub fn offending_sender(&self) -> Option<PartyIndex> {
        match self {
            Error::SessionMismatch { sender }
            | Error::UnknownRound { sender, .. }
            | Error::Misaddressed { sender, .. }
            | Error::MalformedMessage { sender, .. }
            | Error::CommitmentMismatch { sender, .. }
            | Error::CommitmentCount { sender, .. }
            | Error::ShareCount { sender, .. }
            | Error::PublicValueMismatch { sender, .. }
            | Error::InvalidShare { sender, .. }
            | Error::InvalidProof { sender, .. }
            | Error::PublicShareMismatch { sender, .. } => Some(*sender),
            Error::UnknownSender(sender) => Some(*sender),
            _ => None,
        }
    }

    /// The round the error was raised in, when known.
    pub fn round(&self) -> Option<u8> {
        match self {
            Error::InvalidRound(round)
            | Error::UnknownRound { round, .. }
            | Error::MalformedMessage { round, .. }
            | Error::NotReady { round, .. }
            | Error::CommitmentMismatch { round, .. }
            | Error::CommitmentCount { round, .. }
            | Error::ShareCount { round, .. }
            | Error::PublicValueMismatch { round, .. }
            | Error::InvalidShare { round, .. }
            | Error::InvalidProof { round, .. }
            | Error::PublicShareMismatch { round, .. } => Some(*round),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let not_ready = Error::NotReady {
            round: 2,
            missing: vec![3],
        };
        assert!(not_ready.is_retryable());
        assert!(!not_ready.is_fatal());
        assert_eq!(not_ready.round(), Some(2));
        assert_eq!(not_ready.offending_sender(), None);

        let bad_share = Error::InvalidShare { round: 3, sender: 2 };
        assert!(bad_share.is_fatal());
        assert!(!bad_share.is_retryable());
        assert_eq!(bad_share.offending_sender(), Some(2));

        assert!(Error::OutboxBusy.is_retryable());
        assert!(!Error::UnknownSender(9).is_fatal());
    }

    #[test]
    fn test_admission_errors_are_not_fatal() {
        let bad_tag = Error::UnknownRound { round: 9, sender: 2 };
        assert!(!bad_tag.is_fatal());
        assert!(!bad_tag.is_retryable());
        assert_eq!(bad_tag.offending_sender(), Some(2));

        let misaddressed = Error::Misaddressed { sender: 3, to: 1 };
        assert!(!misaddressed.is_fatal());
        assert_eq!(misaddressed.offending_sender(), Some(3));

        // Only the dispatcher raises InvalidRound, and it cannot recover.
        assert!(Error::InvalidRound(7).is_fatal());
    }
}
