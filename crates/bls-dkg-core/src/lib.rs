//! # BLS DKG Core
//!
//! Dealerless distributed key generation for threshold BLS on BLS12-381.
//!
//! This crate provides:
//! - Feldman verifiable secret sharing with hash commit/reveal ([`vss`])
//! - A Schnorr proof of knowledge of a secret share ([`proof`])
//! - The five-round DKG session state machine ([`keygen`])
//!
//! ## Protocol Overview
//!
//! Every party deals a random degree-`t` polynomial, commits to its Feldman
//! commitments, reveals them, hands each peer a share and finally proves it
//! knows the sum of the shares it received. The group public key is the sum
//! of every dealer's constant-term commitment, and any `t + 1` parties can
//! reconstruct the matching secret.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bls_dkg_core::{curve, keygen::Session, SessionConfig};
//!
//! curve::init()?;
//! let session = Session::new(SessionConfig::sequential(session_id, 1, 1, 3)?)?;
//! loop {
//!     for msg in transport.receive() {
//!         session.push_message(msg)?;
//!     }
//!     match session.proceed() {
//!         Ok(()) => {}
//!         Err(e) if e.is_retryable() => {}
//!         Err(e) => return Err(e),
//!     }
//!     transport.send(session.get_outgoing()?);
//!     if let Some(output) = session.output() {
//!         break output;
//!     }
//! }
//! ```

pub mod curve;
pub mod error;
pub mod keygen;
pub mod proof;
pub mod types;
pub mod vss;

pub use error::{Error, Result};
pub use keygen::{DkgMessage, DkgMessageBody, Session};
pub use types::{DkgOutput, PartyIndex, SessionConfig, SessionId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default threshold for a 3-party setup
pub const DEFAULT_THRESHOLD: usize = 1;

/// Default number of parties
pub const DEFAULT_PARTIES: u32 = 3;
