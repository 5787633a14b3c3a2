//! Feldman verifiable secret sharing and hash commitments
//!
//! Each party deals a random polynomial `f(x) = a_0 + a_1 x + ... + a_t x^t`,
//! publishes `C_k = a_k·G` for every coefficient and hands party `i` the
//! share `f(i)`. Before revealing the `C_k` it broadcasts
//! `SHA-256(index || blind || C_0 || ... || C_t)` so no dealer can pick its
//! polynomial after seeing the others.

use crate::curve;
use crate::PartyIndex;
use bls12_381::{G1Affine, G1Projective, Scalar};
use ff::Field;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a commitment digest
pub const COMMITMENT_LEN: usize = 32;

/// Length of the blinding nonce mixed into the commitment
pub const BLIND_FACTOR_LEN: usize = 32;

/// A dealer's secret polynomial. Coefficients are cleared on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Wrap explicit coefficients, constant term first.
    pub fn from_coefficients(coefficients: Vec<Scalar>) -> Self {
        Self { coefficients }
    }

    /// Degree of the polynomial (the threshold).
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn coefficients(&self) -> &[Scalar] {
        &self.coefficients
    }

    /// The dealt secret `f(0)`.
    pub fn constant_term(&self) -> Scalar {
        self.coefficients.first().copied().unwrap_or(Scalar::ZERO)
    }

    /// Evaluate at a party index using Horner's rule.
    pub fn evaluate(&self, x: PartyIndex) -> Scalar {
        let x = Scalar::from(u64::from(x));
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coeff| acc * x + coeff)
    }
}

/// Draw `degree + 1` independent random coefficients.
pub fn generate_polynomial<R: RngCore + CryptoRng>(degree: usize, rng: &mut R) -> Polynomial {
    let coefficients = (0..=degree).map(|_| curve::random_scalar(rng)).collect();
    Polynomial { coefficients }
}

/// Feldman commitments `C_k = a_k·G`, constant term first.
pub fn decommitment(polynomial: &Polynomial) -> Vec<G1Affine> {
    polynomial
        .coefficients
        .iter()
        .map(|coeff| G1Affine::from(curve::public_key(coeff)))
        .collect()
}

/// `SHA-256(party_index || blind_factor || C_0 || ... || C_t)`
pub fn commitment_hash(
    party_index: PartyIndex,
    blind_factor: &[u8; BLIND_FACTOR_LEN],
    decommitment: &[G1Affine],
) -> [u8; COMMITMENT_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(party_index.to_be_bytes());
    hasher.update(blind_factor);
    for point in decommitment {
        hasher.update(point.to_compressed());
    }
    hasher.finalize().into()
}

/// Check a revealed decommitment against an earlier commitment digest.
pub fn verify_commitment(
    claimed: &[u8; COMMITMENT_LEN],
    party_index: PartyIndex,
    blind_factor: &[u8; BLIND_FACTOR_LEN],
    decommitment: &[G1Affine],
) -> bool {
    let expected = commitment_hash(party_index, blind_factor, decommitment);
    expected[..].ct_eq(&claimed[..]).into()
}

/// Public share `Σ C_k · x^k` of index `x` under one dealer's commitments.
pub fn evaluate_commitments(commitments: &[G1Affine], x: PartyIndex) -> G1Projective {
    let x = Scalar::from(u64::from(x));
    commitments
        .iter()
        .rev()
        .fold(G1Projective::identity(), |acc, commitment| {
            acc * x + G1Projective::from(commitment)
        })
}

/// Verify that `share` lies on the polynomial committed to by `commitments`.
///
/// Returns false for index zero or if the commitment count is not
/// `threshold + 1`.
pub fn verify_share(
    share: &Scalar,
    recipient: PartyIndex,
    threshold: usize,
    commitments: &[G1Affine],
) -> bool {
    if recipient == 0 || commitments.len() != threshold + 1 {
        return false;
    }
    curve::public_key(share) == evaluate_commitments(commitments, recipient)
}

/// Recover `f(0)` from `(index, f(index))` pairs by Lagrange interpolation.
///
/// Returns `None` if the set is empty or contains a repeated or zero index.
pub fn interpolate_at_zero(shares: &[(PartyIndex, Scalar)]) -> Option<Scalar> {
    if shares.is_empty() {
        return None;
    }

    let mut secret = Scalar::ZERO;
    for (i, (x_i, y_i)) in shares.iter().enumerate() {
        if *x_i == 0 {
            return None;
        }
        let x_i = Scalar::from(u64::from(*x_i));
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;

        for (j, (x_j, _)) in shares.iter().enumerate() {
            if i == j {
                continue;
            }
            let x_j = Scalar::from(u64::from(*x_j));
            numerator *= x_j;
            denominator *= x_j - x_i;
        }

        let inverse: Option<Scalar> = denominator.invert().into();
        secret += *y_i * numerator * inverse?;
    }

    Some(secret)
}
