//! BLS12-381 primitives used by the DKG
//!
//! Secret keys are scalars of the BLS12-381 scalar field and public keys are
//! G1 points in 48-byte compressed form.

use crate::{Error, Result};
use bls12_381::{G1Affine, G1Projective, Scalar};
use ff::Field;
use group::Curve;
use rand_core::{CryptoRng, RngCore};
use std::sync::OnceLock;
use tracing::info;

/// Length of a compressed G1 public key
pub const PUBLIC_KEY_LEN: usize = 48;

/// Length of a serialized scalar
pub const SCALAR_LEN: usize = 32;

/// Curve parameters recorded by [`init`]
#[derive(Debug)]
struct CurveParams {
    generator: [u8; PUBLIC_KEY_LEN],
}

static PARAMS: OnceLock<CurveParams> = OnceLock::new();

/// Initialize the curve backend.
///
/// Must be called by the composition root before any session is created.
/// Safe to call any number of times; only the first call does work.
pub fn init() -> Result<()> {
    if PARAMS.get().is_some() {
        return Ok(());
    }

    let generator = G1Affine::generator();
    if !bool::from(generator.is_on_curve()) || !bool::from(generator.is_torsion_free()) {
        return Err(Error::Crypto("G1 generator failed validation".into()));
    }

    let encoded = generator.to_compressed();
    let decoded = Option::<G1Affine>::from(G1Affine::from_compressed(&encoded))
        .ok_or_else(|| Error::Crypto("G1 generator does not round-trip".into()))?;
    if decoded != generator {
        return Err(Error::Crypto("G1 generator does not round-trip".into()));
    }

    if PARAMS.set(CurveParams { generator: encoded }).is_ok() {
        info!(generator = %hex::encode(encoded), "BLS12-381 backend initialized");
    }
    Ok(())
}

/// Whether [`init`] has completed.
pub fn is_initialized() -> bool {
    PARAMS.get().is_some()
}

pub(crate) fn ensure_initialized() -> Result<()> {
    if is_initialized() {
        Ok(())
    } else {
        Err(Error::NotInitialized)
    }
}

/// Compressed encoding of the G1 generator.
pub fn generator_bytes() -> Result<[u8; PUBLIC_KEY_LEN]> {
    PARAMS.get().map(|p| p.generator).ok_or(Error::NotInitialized)
}

/// Draw a uniformly random scalar.
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

/// Public key `s·G` for a secret scalar.
pub fn public_key(secret: &Scalar) -> G1Projective {
    G1Projective::generator() * secret
}

/// Compressed encoding of a point.
pub fn encode_point(point: &G1Projective) -> [u8; PUBLIC_KEY_LEN] {
    point.to_affine().to_compressed()
}

/// Decode a compressed point, rejecting off-curve and non-subgroup input.
pub fn decode_point(bytes: &[u8]) -> Option<G1Affine> {
    let array: [u8; PUBLIC_KEY_LEN] = bytes.try_into().ok()?;
    Option::from(G1Affine::from_compressed(&array))
}

/// Canonical little-endian scalar encoding.
pub fn encode_scalar(scalar: &Scalar) -> [u8; SCALAR_LEN] {
    scalar.to_bytes()
}

/// Decode a canonical scalar.
pub fn decode_scalar(bytes: &[u8]) -> Option<Scalar> {
    let array: [u8; SCALAR_LEN] = bytes.try_into().ok()?;
    Option::from(Scalar::from_bytes(&array))
}

/// Reduce 64 uniformly random bytes to a scalar.
pub fn scalar_from_wide(bytes: &[u8; 64]) -> Scalar {
    Scalar::from_bytes_wide(bytes)
}
