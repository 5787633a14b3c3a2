//! Distributed Key Generation (DKG) module
//!
//! Implements a joint-Feldman DKG for threshold BLS keys, driven as a
//! five-round state machine.
//!
//! A [`Session`] is fed with [`Session::push_message`], advanced with
//! [`Session::proceed`] and drained with [`Session::get_outgoing`]. The
//! caller owns the loop: it keeps calling `proceed` while the error is
//! retryable ([`Error::is_retryable`]) and aborts on anything fatal.
//!
//! | Round | Waits for | Sends |
//! |---|---|---|
//! | 0 | nothing | nothing (commitments computed) |
//! | 1 | nothing | commitment digest |
//! | 2 | every digest | reveal; to each peer, commitments and its share |
//! | 3 | every reveal and deal | proof of knowledge of the final share |
//! | 4 | every proof | nothing (output produced) |

mod messages;
mod rounds;

pub use messages::{DkgMessage, DkgMessageBody};
pub use rounds::FINAL_ROUND;

use crate::curve;
use crate::vss::{self, BLIND_FACTOR_LEN};
use crate::{DkgOutput, Error, PartyIndex, Result, SessionConfig, SessionId};
use messages::ParsedMessage;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand_core::{CryptoRng, RngCore};
use rounds::SessionState;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

/// One party's view of a DKG run.
///
/// Round state and inboxes sit behind one lock and the outbox behind
/// another, so draining outgoing messages never waits on round computation.
pub struct Session {
    config: SessionConfig,
    state: Mutex<SessionState>,
    outbox: Mutex<Vec<DkgMessage>>,
}

impl Session {
    /// Create a new DKG session using the operating system RNG
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_rng(config, &mut OsRng)
    }

    /// Create a new DKG session drawing secrets from `rng`
    #[instrument(skip_all, fields(party = config.party_index))]
    pub fn with_rng<R: RngCore + CryptoRng>(config: SessionConfig, rng: &mut R) -> Result<Self> {
        curve::ensure_initialized()?;
        config.validate()?;

        let polynomial = vss::generate_polynomial(config.threshold, rng);
        let mut blind_factor = [0u8; BLIND_FACTOR_LEN];
        rng.fill_bytes(&mut blind_factor);
        let dlog_r = curve::random_scalar(rng);

        info!(
            party = config.party_index,
            n_parties = config.n_parties(),
            threshold = config.threshold,
            session_id = %hex::encode(config.session_id),
            "Starting DKG"
        );

        let state = SessionState::new(config.clone(), polynomial, blind_factor, dlog_r);
        Ok(Self {
            config,
            state: Mutex::new(state),
            outbox: Mutex::new(Vec::new()),
        })
    }

    /// Advance by one round if the current round's inputs are complete.
    ///
    /// Returns [`Error::NotReady`] while peer messages are outstanding and a
    /// named fatal error if a peer's message fails validation.
    pub fn proceed(&self) -> Result<()> {
        let mut state = self.state.lock();
        let outgoing = state.proceed()?;
        if !outgoing.is_empty() {
            self.outbox.lock().extend(outgoing);
        }
        Ok(())
    }

    /// Validate a message and file it under its round and sender.
    pub fn push_message(&self, message: DkgMessage) -> Result<()> {
        let sender = message.sender;
        let round = message.round;

        if message.session_id != self.config.session_id {
            debug!(sender, round, "Dropping message from another session");
            return Err(Error::SessionMismatch { sender });
        }
        if !self.config.committee.contains(&sender) {
            debug!(sender, round, "Dropping message from non-member");
            return Err(Error::UnknownSender(sender));
        }
        if let Some(to) = message.to.filter(|&to| to != self.config.party_index) {
            debug!(sender, round, to, "Dropping message addressed elsewhere");
            return Err(Error::Misaddressed { sender, to });
        }

        let parsed = ParsedMessage::parse(message).map_err(|e| {
            debug!(sender, round, error = %e, "Dropping malformed message");
            e
        })?;

        // A deal may only carry the share meant for us.
        let my_position = self
            .config
            .committee
            .iter()
            .position(|&p| p == self.config.party_index)
            .ok_or(Error::PartyNotInCommittee(self.config.party_index))?;
        if !parsed.holds_only_slot(my_position) {
            debug!(sender, round, "Dropping deal carrying other parties' shares");
            return Err(Error::MalformedMessage {
                round,
                sender,
                reason: "deal carries shares for other parties",
            });
        }

        let mut state = self.state.lock();
        trace!(
            party = self.config.party_index,
            sender,
            round,
            current = state.round,
            "Message accepted"
        );
        state.inbox.insert(parsed);
        Ok(())
    }

    /// Take every queued outgoing message.
    ///
    /// Never blocks: if another caller is draining the outbox this returns
    /// [`Error::OutboxBusy`] and nothing is lost.
    pub fn get_outgoing(&self) -> Result<Vec<DkgMessage>> {
        let mut outbox = self.outbox.try_lock().ok_or(Error::OutboxBusy)?;
        Ok(std::mem::take(&mut *outbox))
    }

    /// Current round
    pub fn round(&self) -> u8 {
        self.state.lock().round
    }

    /// Key material, once round 4 has completed
    pub fn output(&self) -> Option<Arc<DkgOutput>> {
        self.state.lock().output.clone()
    }

    /// Whether the output has been produced
    pub fn is_complete(&self) -> bool {
        self.state.lock().output.is_some()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.config.session_id
    }

    pub fn party_index(&self) -> PartyIndex {
        self.config.party_index
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold
    }

    pub fn committee(&self) -> &[PartyIndex] {
        &self.config.committee
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::DlogProof;
    use crate::vss::interpolate_at_zero;
    use bls12_381::{G1Affine, Scalar};
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    const SESSION: SessionId = [42u8; 32];

    fn setup(n: u32, t: usize) -> Vec<Session> {
        curve::init().unwrap();
        (1..=n)
            .map(|i| {
                let config = SessionConfig::sequential(SESSION, i, t, n).unwrap();
                let mut rng = ChaCha20Rng::seed_from_u64(u64::from(i));
                Session::with_rng(config, &mut rng).unwrap()
            })
            .collect()
    }

    /// Hand a message to its recipient, or to every session if broadcast.
    fn route(sessions: &[Session], msg: &DkgMessage) {
        for target in sessions {
            if msg.recipient().map_or(true, |to| to == target.party_index()) {
                target.push_message(msg.clone()).unwrap();
            }
        }
    }

    /// Drain every outbox and route each message.
    fn deliver(sessions: &[Session]) {
        for session in sessions {
            for msg in session.get_outgoing().unwrap() {
                route(sessions, &msg);
            }
        }
    }

    fn step(sessions: &[Session]) {
        for session in sessions.iter().filter(|s| !s.is_complete()) {
            match session.proceed() {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => panic!("party {}: {e}", session.party_index()),
            }
        }
    }

    /// Drive all sessions until every one has produced output.
    fn run(sessions: &[Session]) {
        for _ in 0..32 {
            if sessions.iter().all(Session::is_complete) {
                return;
            }
            step(sessions);
            deliver(sessions);
        }
        panic!("DKG did not converge");
    }

    /// Drive all sessions until they sit at `round`.
    fn run_to(sessions: &[Session], round: u8) {
        for _ in 0..32 {
            if sessions.iter().all(|s| s.round() == round) {
                return;
            }
            for session in sessions {
                if session.round() < round {
                    let _ = session.proceed();
                }
            }
            deliver(sessions);
        }
        panic!("sessions did not reach round {round}");
    }

    #[test]
    fn test_create_starts_at_round_zero() {
        let sessions = setup(4, 2);
        for session in &sessions {
            assert_eq!(session.round(), 0);
            assert!(session.output().is_none());
            assert!(session.get_outgoing().unwrap().is_empty());
        }
    }

    #[test]
    fn test_create_rejects_bad_committee() {
        curve::init().unwrap();
        let zero = SessionConfig {
            session_id: SESSION,
            party_index: 1,
            threshold: 1,
            committee: vec![1, 0, 2],
        };
        assert!(matches!(Session::new(zero), Err(Error::ZeroPartyIndex)));

        let dup = SessionConfig {
            session_id: SESSION,
            party_index: 1,
            threshold: 1,
            committee: vec![1, 3, 3],
        };
        assert!(matches!(Session::new(dup), Err(Error::DuplicatePartyIndex(3))));
    }

    #[test]
    fn test_end_to_end_three_parties() {
        let sessions = setup(3, 1);
        run(&sessions);

        let outputs: Vec<_> = sessions.iter().map(|s| s.output().unwrap()).collect();
        let group_key = outputs[0].group_public_key.clone();
        for output in &outputs {
            assert_eq!(output.group_public_key, group_key);
            assert_eq!(output.committee, vec![1, 2, 3]);
            assert_eq!(output.public_shares.len(), 3);
        }

        let distinct: HashSet<[u8; 32]> = outputs.iter().map(|o| o.secret_share).collect();
        assert_eq!(distinct.len(), 3);

        // Each declared public share matches the holder's secret share.
        for output in &outputs {
            let secret = output.secret_scalar().unwrap();
            let public = curve::encode_point(&curve::public_key(&secret)).to_vec();
            for other in &outputs {
                assert_eq!(other.public_shares[&output.party_index], public);
            }
        }

        // Any t + 1 shares reconstruct the group secret.
        let shares: Vec<(PartyIndex, Scalar)> = outputs
            .iter()
            .map(|o| (o.party_index, o.secret_scalar().unwrap()))
            .collect();
        for pair in [[0, 1], [0, 2], [1, 2]] {
            let subset = [shares[pair[0]], shares[pair[1]]];
            let secret = interpolate_at_zero(&subset).unwrap();
            assert_eq!(
                curve::encode_point(&curve::public_key(&secret)).to_vec(),
                group_key
            );
        }
    }

    #[test]
    fn test_end_to_end_sparse_committee() {
        curve::init().unwrap();
        let committee = vec![10, 3, 7, 21, 5];
        let sessions: Vec<Session> = committee
            .iter()
            .map(|&i| {
                let config = SessionConfig::new(SESSION, i, 2, committee.clone()).unwrap();
                Session::new(config).unwrap()
            })
            .collect();
        run(&sessions);

        let outputs: Vec<_> = sessions.iter().map(|s| s.output().unwrap()).collect();
        let shares: Vec<(PartyIndex, Scalar)> = outputs
            .iter()
            .map(|o| (o.party_index, o.secret_scalar().unwrap()))
            .collect();
        let secret = interpolate_at_zero(&shares[1..4]).unwrap();
        let expected = outputs[0].group_public_key_point().unwrap();
        assert_eq!(G1Affine::from(curve::public_key(&secret)), expected);
    }

    #[test]
    fn test_not_ready_until_all_commitments_arrive() {
        let sessions = setup(3, 1);
        sessions[0].proceed().unwrap();
        sessions[0].proceed().unwrap();
        assert_eq!(sessions[0].round(), 2);

        let err = sessions[0].proceed().unwrap_err();
        assert_eq!(
            err,
            Error::NotReady {
                round: 2,
                missing: vec![2, 3]
            }
        );
        assert!(err.is_retryable());
        assert_eq!(sessions[0].round(), 2);
    }

    #[test]
    fn test_get_outgoing_drains_once() {
        let sessions = setup(3, 1);
        sessions[0].proceed().unwrap();
        sessions[0].proceed().unwrap();

        let first = sessions[0].get_outgoing().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].round(), 1);
        assert!(sessions[0].get_outgoing().unwrap().is_empty());
    }

    #[test]
    fn test_get_outgoing_never_blocks() {
        let sessions = setup(3, 1);
        let _guard = sessions[0].outbox.lock();
        assert_eq!(sessions[0].get_outgoing(), Err(Error::OutboxBusy));
    }

    #[test]
    fn test_push_from_non_member_rejected() {
        let sessions = setup(3, 1);
        let msg = DkgMessage::new(SESSION, 9, DkgMessageBody::Round1 { commitment: [1; 32] });
        assert_eq!(
            sessions[0].push_message(msg),
            Err(Error::UnknownSender(9))
        );
        assert_eq!(sessions[0].state.lock().inbox.len(), 0);
    }

    #[test]
    fn test_push_from_other_session_rejected() {
        let sessions = setup(3, 1);
        let msg = DkgMessage::new([0; 32], 2, DkgMessageBody::Round1 { commitment: [1; 32] });
        assert_eq!(
            sessions[0].push_message(msg),
            Err(Error::SessionMismatch { sender: 2 })
        );
        assert_eq!(sessions[0].state.lock().inbox.len(), 0);
    }

    #[test]
    fn test_push_overwrites_same_sender() {
        let sessions = setup(3, 1);
        for commitment in [[1u8; 32], [2u8; 32]] {
            let msg = DkgMessage::new(SESSION, 2, DkgMessageBody::Round1 { commitment });
            sessions[0].push_message(msg).unwrap();
        }
        let state = sessions[0].state.lock();
        assert_eq!(state.inbox.round1.len(), 1);
        assert_eq!(state.inbox.round1[&2].commitment, [2u8; 32]);
    }

    #[test]
    fn test_stale_replay_does_not_affect_later_round() {
        let sessions = setup(3, 1);
        run_to(&sessions, 3);

        // A late, conflicting round 1 message from party 2 lands in the old
        // inbox but the round 3 gate uses the digests frozen in round 2.
        let replay = DkgMessage::new(SESSION, 2, DkgMessageBody::Round1 { commitment: [0xee; 32] });
        sessions[0].push_message(replay).unwrap();

        run(&sessions);
        assert!(sessions.iter().all(Session::is_complete));
    }

    fn deliver_dealt(sessions: &[Session], tamper: impl Fn(&mut DkgMessage)) {
        run_to(sessions, 2);
        step(sessions);
        for session in sessions {
            for mut msg in session.get_outgoing().unwrap() {
                tamper(&mut msg);
                route(sessions, &msg);
            }
        }
    }

    #[test]
    fn test_tampered_reveal_is_commitment_mismatch() {
        let sessions = setup(3, 1);
        deliver_dealt(&sessions, |msg| {
            if let DkgMessageBody::Round2 { blind_factor, .. } = &mut msg.body {
                if msg.sender == 3 {
                    blind_factor[0] ^= 1;
                }
            }
        });
        assert_eq!(
            sessions[0].proceed(),
            Err(Error::CommitmentMismatch { round: 3, sender: 3 })
        );
    }

    #[test]
    fn test_tampered_share_is_invalid_share() {
        let sessions = setup(3, 1);
        deliver_dealt(&sessions, |msg| {
            if let DkgMessageBody::Round3 { shares, .. } = &mut msg.body {
                if msg.sender == 2 && msg.to == Some(1) {
                    let bogus = curve::random_scalar(&mut OsRng);
                    shares[0] = Some(curve::encode_scalar(&bogus).to_vec());
                }
            }
        });

        let err = sessions[0].proceed().unwrap_err();
        assert_eq!(err, Error::InvalidShare { round: 3, sender: 2 });
        assert!(err.is_fatal());
        assert_eq!(err.offending_sender(), Some(2));
        assert_eq!(sessions[0].round(), 3);

        // Party 3's share from party 2 was untouched.
        sessions[2].proceed().unwrap();
    }

    #[test]
    fn test_wrong_commitment_count() {
        let sessions = setup(3, 1);
        deliver_dealt(&sessions, |msg| {
            if let DkgMessageBody::Round3 { commitments, .. } = &mut msg.body {
                if msg.sender == 1 {
                    let extra = commitments[0].clone();
                    commitments.push(extra);
                }
            }
        });
        assert_eq!(
            sessions[1].proceed(),
            Err(Error::CommitmentCount {
                round: 3,
                sender: 1,
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_wrong_share_count() {
        let sessions = setup(3, 1);
        deliver_dealt(&sessions, |msg| {
            if let DkgMessageBody::Round3 { shares, .. } = &mut msg.body {
                if msg.sender == 3 {
                    shares.pop();
                }
            }
        });
        assert_eq!(
            sessions[0].proceed(),
            Err(Error::ShareCount {
                round: 3,
                sender: 3,
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_mismatched_yi() {
        let sessions = setup(3, 1);
        deliver_dealt(&sessions, |msg| {
            if let DkgMessageBody::Round2 { yi, .. } = &mut msg.body {
                if msg.sender == 2 {
                    let other = curve::public_key(&curve::random_scalar(&mut OsRng));
                    *yi = Some(curve::encode_point(&other).to_vec());
                }
            }
        });
        assert_eq!(
            sessions[0].proceed(),
            Err(Error::PublicValueMismatch { round: 3, sender: 2 })
        );
    }

    #[test]
    fn test_missing_yi_is_not_ready() {
        let sessions = setup(3, 1);
        deliver_dealt(&sessions, |msg| {
            if let DkgMessageBody::Round2 { yi, .. } = &mut msg.body {
                if msg.sender == 2 {
                    *yi = None;
                }
            }
        });
        assert_eq!(
            sessions[0].proceed(),
            Err(Error::NotReady {
                round: 3,
                missing: vec![2]
            })
        );
    }

    #[test]
    fn test_deals_are_point_to_point() {
        let sessions = setup(3, 1);
        run_to(&sessions, 2);
        step(&sessions);

        for session in &sessions {
            let outgoing = session.get_outgoing().unwrap();
            let deals: Vec<_> = outgoing.iter().filter(|m| m.round() == 3).collect();
            assert_eq!(deals.len(), 2);
            for deal in &deals {
                let to = deal.recipient().unwrap();
                assert_ne!(to, session.party_index());
                let DkgMessageBody::Round3 { shares, .. } = &deal.body else {
                    panic!("round 3 tag on another payload");
                };
                let filled: Vec<usize> = (0..shares.len()).filter(|&i| shares[i].is_some()).collect();
                assert_eq!(filled, vec![to as usize - 1]);
            }
            for msg in &outgoing {
                route(&sessions, msg);
            }
        }

        // Party 1 holds one evaluation per peer polynomial, too few to
        // interpolate any dealer's secret with t = 1.
        let state = sessions[0].state.lock();
        assert_eq!(state.inbox.round3.len(), 2);
        assert!(!state.inbox.round3.contains_key(&1));
        for deal in state.inbox.round3.values() {
            let held = deal.shares.iter().filter(|s| s.is_some()).count();
            assert_eq!(held, 1);
            assert!(deal.shares[0].is_some());
            assert!(held < state.config.threshold + 1);
        }
    }

    #[test]
    fn test_deal_for_someone_else_is_rejected() {
        let sessions = setup(3, 1);
        let share = || Some(curve::encode_scalar(&curve::random_scalar(&mut OsRng)).to_vec());
        let commitments = vec![
            curve::encode_point(&curve::public_key(&curve::random_scalar(&mut OsRng))).to_vec();
            2
        ];

        let elsewhere = DkgMessage::direct(
            SESSION,
            2,
            3,
            DkgMessageBody::Round3 {
                commitments: commitments.clone(),
                shares: vec![None, None, share()],
            },
        );
        assert_eq!(
            sessions[0].push_message(elsewhere),
            Err(Error::Misaddressed { sender: 2, to: 3 })
        );

        let leaky = DkgMessage::direct(
            SESSION,
            2,
            1,
            DkgMessageBody::Round3 {
                commitments,
                shares: vec![share(), None, share()],
            },
        );
        assert!(matches!(
            sessions[0].push_message(leaky),
            Err(Error::MalformedMessage { round: 3, sender: 2, .. })
        ));
        assert_eq!(sessions[0].state.lock().inbox.len(), 0);
    }

    #[test]
    fn test_spoofed_self_messages_are_ignored() {
        let sessions = setup(3, 1);
        run_to(&sessions, 2);

        // A forged digest claiming to come from party 1 itself.
        let forged = DkgMessage::new(SESSION, 1, DkgMessageBody::Round1 { commitment: [0xab; 32] });
        sessions[0].push_message(forged).unwrap();
        run_to(&sessions, 3);

        let points: Vec<Vec<u8>> = (0..2)
            .map(|_| curve::encode_point(&curve::public_key(&curve::random_scalar(&mut OsRng))).to_vec())
            .collect();
        let reveal = DkgMessage::new(
            SESSION,
            1,
            DkgMessageBody::Round2 {
                decommitment: points.clone(),
                blind_factor: [0; 32],
                yi: Some(points[0].clone()),
            },
        );
        let deal = DkgMessage::direct(
            SESSION,
            1,
            1,
            DkgMessageBody::Round3 {
                commitments: points,
                shares: vec![
                    Some(curve::encode_scalar(&curve::random_scalar(&mut OsRng)).to_vec()),
                    None,
                    None,
                ],
            },
        );
        sessions[0].push_message(reveal).unwrap();
        sessions[0].push_message(deal).unwrap();

        run(&sessions);
        let key = sessions[0].output().unwrap().group_public_key.clone();
        for session in &sessions[1..] {
            assert_eq!(session.output().unwrap().group_public_key, key);
        }
    }

    #[test]
    fn test_tampered_proof_is_invalid_proof() {
        let sessions = setup(3, 1);
        run_to(&sessions, 3);
        step(&sessions);
        for session in &sessions {
            for mut msg in session.get_outgoing().unwrap() {
                if let DkgMessageBody::Round4 { proof } = &mut msg.body {
                    if msg.sender == 3 {
                        proof.response[0] ^= 1;
                    }
                }
                for target in &sessions {
                    target.push_message(msg.clone()).unwrap();
                }
            }
        }
        assert_eq!(
            sessions[0].proceed(),
            Err(Error::InvalidProof { round: 4, sender: 3 })
        );
        assert!(sessions[0].output().is_none());
    }

    #[test]
    fn test_proof_for_foreign_key_is_rejected() {
        let sessions = setup(3, 1);
        run_to(&sessions, 3);
        step(&sessions);
        for session in &sessions {
            for mut msg in session.get_outgoing().unwrap() {
                if msg.sender == 2 {
                    // A valid proof, but for a key unrelated to party 2's share.
                    let secret = curve::random_scalar(&mut OsRng);
                    let nonce = curve::random_scalar(&mut OsRng);
                    let context = crate::proof::ProofContext::new(SESSION, 2);
                    let proof = DlogProof::prove(&secret, &nonce, &context).unwrap();
                    msg.body = DkgMessageBody::Round4 { proof };
                }
                for target in &sessions {
                    target.push_message(msg.clone()).unwrap();
                }
            }
        }
        assert_eq!(
            sessions[0].proceed(),
            Err(Error::PublicShareMismatch { round: 4, sender: 2 })
        );
    }

    #[test]
    fn test_proceed_after_completion() {
        let sessions = setup(3, 1);
        run(&sessions);
        let output = sessions[0].output().unwrap();
        assert_eq!(sessions[0].proceed(), Err(Error::SessionComplete));
        assert_eq!(sessions[0].round(), FINAL_ROUND);
        assert_eq!(sessions[0].output().unwrap().secret_share, output.secret_share);
    }

    #[test]
    fn test_concurrent_proceed_serializes() {
        let sessions = setup(3, 1);
        let session = Arc::new(sessions.into_iter().next().unwrap());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.proceed())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(session.round(), 2);
        let outgoing = session.get_outgoing().unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].round(), 1);
    }
}
