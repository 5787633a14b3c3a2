//! Round gates and effects
//!
//! Every round is a gate (`check_roundN`) that decides whether the round can
//! run and an effect (`roundN`) that performs it. Gates never mutate state;
//! effects only run after their gate succeeded and return the messages to
//! queue for delivery.

use super::messages::{
    encode_points, DkgMessage, DkgMessageBody, ParsedMessage, Payload, Round1, Round2, Round3,
    Round4,
};
use crate::curve;
use crate::proof::{DlogProof, ProofContext};
use crate::vss::{self, Polynomial, BLIND_FACTOR_LEN, COMMITMENT_LEN};
use crate::{DkgOutput, Error, PartyIndex, Result, SessionConfig};
use bls12_381::{G1Affine, G1Projective, Scalar};
use ff::Field;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroize;

#[cfg(feature = "multi-thread")]
use rayon::prelude::*;

/// Last round of the protocol
pub const FINAL_ROUND: u8 = 4;

/// Received messages, one map per round keyed by sender
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    pub round1: HashMap<PartyIndex, Round1>,
    pub round2: HashMap<PartyIndex, Round2>,
    pub round3: HashMap<PartyIndex, Round3>,
    pub round4: HashMap<PartyIndex, Round4>,
}

impl Inbox {
    /// Store a parsed message, replacing any earlier one from the same sender
    pub fn insert(&mut self, message: ParsedMessage) {
        let sender = message.sender;
        match message.payload {
            Payload::Round1(body) => {
                self.round1.insert(sender, body);
            }
            Payload::Round2(body) => {
                self.round2.insert(sender, body);
            }
            Payload::Round3(body) => {
                self.round3.insert(sender, body);
            }
            Payload::Round4(body) => {
                self.round4.insert(sender, body);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.round1.len() + self.round2.len() + self.round3.len() + self.round4.len()
    }
}

/// Everything guarded by the session's state lock
pub(crate) struct SessionState {
    pub config: SessionConfig,
    pub round: u8,
    pub inbox: Inbox,
    pub output: Option<Arc<DkgOutput>>,

    polynomial: Polynomial,
    blind_factor: [u8; BLIND_FACTOR_LEN],
    dlog_r: Scalar,
    own_share: Scalar,

    decommitment: Vec<G1Affine>,
    commitment: Option<[u8; COMMITMENT_LEN]>,

    /// Round 1 digests, frozen when round 2 runs
    peer_commitments: HashMap<PartyIndex, [u8; COMMITMENT_LEN]>,
    /// Verified dealer commitments, frozen when round 3 runs
    dealer_commitments: BTreeMap<PartyIndex, Vec<G1Affine>>,
    final_share: Option<Scalar>,
}

/// Shares addressed to this party, checked by the round 3 gate
struct VerifiedDeal {
    dealer: PartyIndex,
    commitments: Vec<G1Affine>,
    share: Scalar,
}

impl SessionState {
    pub fn new(
        config: SessionConfig,
        polynomial: Polynomial,
        blind_factor: [u8; BLIND_FACTOR_LEN],
        dlog_r: Scalar,
    ) -> Self {
        let own_share = polynomial.evaluate(config.party_index);
        Self {
            config,
            round: 0,
            inbox: Inbox::default(),
            output: None,
            polynomial,
            blind_factor,
            dlog_r,
            own_share,
            decommitment: Vec::new(),
            commitment: None,
            peer_commitments: HashMap::new(),
            dealer_commitments: BTreeMap::new(),
            final_share: None,
        }
    }

    /// Run the current round's gate and, if it passes, its effect.
    pub fn proceed(&mut self) -> Result<Vec<DkgMessage>> {
        if self.output.is_some() {
            return Err(Error::SessionComplete);
        }

        let round = self.round;
        let result = match round {
            0 => self.round0(),
            1 => {
                let commitment = self.check_round1().map_err(|e| self.report(e))?;
                self.round1(commitment)
            }
            2 => {
                let commitment = self.check_round2().map_err(|e| self.report(e))?;
                self.round2(commitment)
            }
            3 => {
                let deals = self.check_round3().map_err(|e| self.report(e))?;
                self.round3(deals)
            }
            4 => {
                let public_shares = self.check_round4().map_err(|e| self.report(e))?;
                self.round4(public_shares)
            }
            other => Err(Error::InvalidRound(other)),
        };

        if result.is_ok() {
            debug!(
                party = self.config.party_index,
                from = round,
                to = self.round,
                "Round complete"
            );
        }
        result
    }

    fn report(&self, error: Error) -> Error {
        if error.is_fatal() {
            warn!(
                party = self.config.party_index,
                round = ?error.round(),
                offender = ?error.offending_sender(),
                %error,
                "Round validation failed"
            );
        } else {
            trace!(party = self.config.party_index, %error, "Round not ready");
        }
        error
    }

    fn context(&self, prover: PartyIndex) -> ProofContext {
        ProofContext::new(self.config.session_id, prover)
    }

    fn message(&self, body: DkgMessageBody) -> DkgMessage {
        DkgMessage::new(self.config.session_id, self.config.party_index, body)
    }

    fn position(&self, party: PartyIndex) -> Option<usize> {
        self.config.committee.iter().position(|&p| p == party)
    }

    /// Peers whose input is still outstanding. This party's own input
    /// always comes from local state, never from the inbox.
    fn missing<F>(&self, round: u8, present: F) -> Result<()>
    where
        F: Fn(PartyIndex) -> bool,
    {
        let me = self.config.party_index;
        let missing: Vec<PartyIndex> = self
            .config
            .committee
            .iter()
            .copied()
            .filter(|&p| p != me && !present(p))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::NotReady { round, missing })
        }
    }

    /// Round 0: derive the Feldman commitments and the digest binding them.
    fn round0(&mut self) -> Result<Vec<DkgMessage>> {
        self.decommitment = vss::decommitment(&self.polynomial);
        self.commitment = Some(vss::commitment_hash(
            self.config.party_index,
            &self.blind_factor,
            &self.decommitment,
        ));
        self.round = 1;
        Ok(Vec::new())
    }

    fn check_round1(&self) -> Result<[u8; COMMITMENT_LEN]> {
        self.commitment.ok_or(Error::NotReady {
            round: 1,
            missing: vec![self.config.party_index],
        })
    }

    /// Round 1: broadcast the commitment digest.
    fn round1(&mut self, commitment: [u8; COMMITMENT_LEN]) -> Result<Vec<DkgMessage>> {
        self.round = 2;
        Ok(vec![self.message(DkgMessageBody::Round1 { commitment })])
    }

    fn check_round2(&self) -> Result<[u8; COMMITMENT_LEN]> {
        self.missing(2, |p| self.inbox.round1.contains_key(&p))?;
        self.check_round1()
    }

    /// Round 2: freeze everyone's digest, then reveal and deal.
    ///
    /// Each peer gets its own deal carrying only its share; the slots of
    /// every other member stay empty.
    fn round2(&mut self, commitment: [u8; COMMITMENT_LEN]) -> Result<Vec<DkgMessage>> {
        let me = self.config.party_index;
        let mut peer_commitments: HashMap<_, _> = self
            .inbox
            .round1
            .iter()
            .filter(|(&sender, _)| sender != me)
            .map(|(&sender, msg)| (sender, msg.commitment))
            .collect();
        peer_commitments.insert(me, commitment);
        self.peer_commitments = peer_commitments;

        let decommitment = encode_points(&self.decommitment);
        let yi = decommitment.first().cloned();

        let mut outgoing = Vec::with_capacity(self.config.committee.len());
        outgoing.push(self.message(DkgMessageBody::Round2 {
            decommitment: decommitment.clone(),
            blind_factor: self.blind_factor,
            yi,
        }));

        let n = self.config.committee.len();
        for (position, &recipient) in self.config.committee.iter().enumerate() {
            if recipient == me {
                continue;
            }
            let mut shares = vec![None; n];
            shares[position] =
                Some(curve::encode_scalar(&self.polynomial.evaluate(recipient)).to_vec());
            outgoing.push(DkgMessage::direct(
                self.config.session_id,
                me,
                recipient,
                DkgMessageBody::Round3 {
                    commitments: decommitment.clone(),
                    shares,
                },
            ));
        }

        self.round = 3;
        Ok(outgoing)
    }

    fn check_round3(&self) -> Result<Vec<VerifiedDeal>> {
        self.missing(3, |p| {
            self.inbox.round2.get(&p).map_or(false, |m| m.yi.is_some())
                && self.inbox.round3.contains_key(&p)
        })?;

        let me = self.config.party_index;
        let my_position = self.position(me).ok_or(Error::PartyNotInCommittee(me))?;
        for_each_member(&self.config.committee, |dealer| {
            self.check_deal(dealer, my_position)
        })
    }

    fn check_deal(&self, dealer: PartyIndex, my_position: usize) -> Result<VerifiedDeal> {
        const ROUND: u8 = 3;
        let threshold = self.config.threshold;
        let n = self.config.committee.len();

        // Our own deal is taken from local state, not from the wire.
        if dealer == self.config.party_index {
            return Ok(VerifiedDeal {
                dealer,
                commitments: self.decommitment.clone(),
                share: self.own_share,
            });
        }

        let (Some(reveal), Some(deal)) = (
            self.inbox.round2.get(&dealer),
            self.inbox.round3.get(&dealer),
        ) else {
            return Err(Error::NotReady {
                round: ROUND,
                missing: vec![dealer],
            });
        };

        let digest = self
            .peer_commitments
            .get(&dealer)
            .ok_or(Error::CommitmentMismatch {
                round: ROUND,
                sender: dealer,
            })?;
        if !vss::verify_commitment(digest, dealer, &reveal.blind_factor, &reveal.decommitment) {
            return Err(Error::CommitmentMismatch {
                round: ROUND,
                sender: dealer,
            });
        }

        if deal.commitments.len() != threshold + 1 {
            return Err(Error::CommitmentCount {
                round: ROUND,
                sender: dealer,
                expected: threshold + 1,
                actual: deal.commitments.len(),
            });
        }
        if deal.shares.len() != n {
            return Err(Error::ShareCount {
                round: ROUND,
                sender: dealer,
                expected: n,
                actual: deal.shares.len(),
            });
        }

        if reveal.decommitment != deal.commitments || reveal.yi != Some(deal.commitments[0]) {
            return Err(Error::PublicValueMismatch {
                round: ROUND,
                sender: dealer,
            });
        }

        let share = deal
            .shares
            .get(my_position)
            .copied()
            .flatten()
            .filter(|share| {
                vss::verify_share(share, self.config.party_index, threshold, &deal.commitments)
            })
            .ok_or(Error::InvalidShare {
                round: ROUND,
                sender: dealer,
            })?;

        Ok(VerifiedDeal {
            dealer,
            commitments: deal.commitments.clone(),
            share,
        })
    }

    /// Round 3: combine every dealer's share and prove knowledge of the sum.
    fn round3(&mut self, deals: Vec<VerifiedDeal>) -> Result<Vec<DkgMessage>> {
        let final_share = deals
            .iter()
            .fold(Scalar::ZERO, |acc, deal| acc + deal.share);
        self.dealer_commitments = deals
            .into_iter()
            .map(|deal| (deal.dealer, deal.commitments))
            .collect();

        let proof = DlogProof::prove(
            &final_share,
            &self.dlog_r,
            &self.context(self.config.party_index),
        )
        .ok_or_else(|| Error::Crypto("degenerate secret share or nonce".into()))?;

        self.final_share = Some(final_share);
        self.round = 4;
        Ok(vec![self.message(DkgMessageBody::Round4 { proof })])
    }

    /// Public key share of `party` implied by all dealers' commitments.
    fn public_share(&self, party: PartyIndex) -> G1Projective {
        self.dealer_commitments
            .values()
            .fold(G1Projective::identity(), |acc, commitments| {
                acc + vss::evaluate_commitments(commitments, party)
            })
    }

    fn check_round4(&self) -> Result<BTreeMap<PartyIndex, Vec<u8>>> {
        const ROUND: u8 = 4;
        self.missing(ROUND, |p| self.inbox.round4.contains_key(&p))?;

        let shares = for_each_member(&self.config.committee, |party| {
            let Some(msg) = self.inbox.round4.get(&party) else {
                return Err(Error::NotReady {
                    round: ROUND,
                    missing: vec![party],
                });
            };
            if !msg.proof.verify(&self.context(party)) {
                return Err(Error::InvalidProof {
                    round: ROUND,
                    sender: party,
                });
            }
            let expected = curve::encode_point(&self.public_share(party));
            if msg.proof.public_key != expected {
                return Err(Error::PublicShareMismatch {
                    round: ROUND,
                    sender: party,
                });
            }
            Ok((party, expected.to_vec()))
        })?;

        Ok(shares.into_iter().collect())
    }

    /// Round 4: aggregate the group key and publish the output.
    fn round4(&mut self, public_shares: BTreeMap<PartyIndex, Vec<u8>>) -> Result<Vec<DkgMessage>> {
        let final_share = self
            .final_share
            .ok_or(Error::InvalidRound(FINAL_ROUND))?;

        let group_key = self
            .dealer_commitments
            .values()
            .filter_map(|commitments| commitments.first())
            .fold(G1Projective::identity(), |acc, c| acc + G1Projective::from(c));

        let output = DkgOutput {
            session_id: self.config.session_id,
            party_index: self.config.party_index,
            threshold: self.config.threshold,
            committee: self.config.committee.clone(),
            group_public_key: curve::encode_point(&group_key).to_vec(),
            secret_share: curve::encode_scalar(&final_share),
            public_shares,
        };

        info!(
            party = self.config.party_index,
            group_public_key = %output.group_public_key_hex(),
            "DKG completed successfully"
        );

        self.output = Some(Arc::new(output));
        Ok(Vec::new())
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.blind_factor.zeroize();
        self.dlog_r.zeroize();
        self.own_share.zeroize();
        self.final_share.zeroize();
    }
}

/// Run `check` for every committee member, in parallel when enabled.
///
/// The first failure in committee order is returned so errors are
/// reproducible regardless of scheduling.
fn for_each_member<T, F>(committee: &[PartyIndex], check: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(PartyIndex) -> Result<T> + Sync + Send,
{
    #[cfg(feature = "multi-thread")]
    let results: Vec<Result<T>> = committee.par_iter().map(|&p| check(p)).collect();
    #[cfg(not(feature = "multi-thread"))]
    let results: Vec<Result<T>> = committee.iter().map(|&p| check(p)).collect();

    results.into_iter().collect()
}
