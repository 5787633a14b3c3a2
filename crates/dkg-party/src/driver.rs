//! Drives a single DKG session to completion over a transport

use crate::network::{NetworkError, Transport};
use bls_dkg_core::{DkgOutput, Error, PartyIndex, Session};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

/// Retry policy for the driver loop
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Longest wait between attempts while the session is not ready
    pub poll_interval: Duration,
    /// Give up if the session has not completed by then
    pub timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Reasons a driven session ends without output
#[derive(Debug, Error)]
pub enum DriverError {
    /// A round failed validation; the session cannot continue
    #[error("Party {party}: DKG aborted: {source}")]
    Aborted {
        party: PartyIndex,
        #[source]
        source: Error,
    },

    /// Peers did not deliver in time
    #[error("Party {party}: timed out in round {round}")]
    Timeout { party: PartyIndex, round: u8 },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Party {party}: worker task failed: {message}")]
    Task { party: PartyIndex, message: String },
}

impl DriverError {
    /// Party blamed by an aborted session, if any
    pub fn offender(&self) -> Option<PartyIndex> {
        match self {
            DriverError::Aborted { source, .. } => source.offending_sender(),
            _ => None,
        }
    }
}

/// Run `session` until it produces output, a fatal error occurs or the
/// timeout elapses.
#[instrument(skip_all, fields(party = session.party_index()))]
pub async fn drive_session<T: Transport + ?Sized>(
    session: Arc<Session>,
    transport: Arc<T>,
    config: DriverConfig,
) -> Result<Arc<DkgOutput>, DriverError> {
    let party = session.party_index();
    let deadline = Instant::now() + config.timeout;

    loop {
        match session.get_outgoing() {
            Ok(messages) if !messages.is_empty() => transport.send(party, messages).await?,
            Ok(_) | Err(Error::OutboxBusy) => {}
            Err(source) => return Err(DriverError::Aborted { party, source }),
        }

        if let Some(output) = session.output() {
            info!(party, group_public_key = %output.group_public_key_hex(), "Session finished");
            return Ok(output);
        }

        let worker = Arc::clone(&session);
        let result = tokio::task::spawn_blocking(move || worker.proceed())
            .await
            .map_err(|e| DriverError::Task {
                party,
                message: e.to_string(),
            })?;

        match result {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                if Instant::now() >= deadline {
                    return Err(DriverError::Timeout {
                        party,
                        round: session.round(),
                    });
                }
                debug!(party, error = %e, "Waiting for peers");
                transport.wait_for_activity(config.poll_interval).await;
            }
            Err(source) => {
                error!(
                    party,
                    round = ?source.round(),
                    offender = ?source.offending_sender(),
                    error = %source,
                    "DKG aborted"
                );
                return Err(DriverError::Aborted { party, source });
            }
        }
    }
}
