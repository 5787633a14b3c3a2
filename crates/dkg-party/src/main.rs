//! DKG Party CLI
//!
//! Command-line interface for threshold BLS key generation:
//! - Run an in-process `n`-party DKG and save every party's share
//! - Inspect a saved share
//! - Check that a quorum of saved shares reconstructs the group key

mod driver;
mod network;

use anyhow::{bail, ensure, Context, Result};
use bls_dkg_core::{curve, vss, DkgOutput, PartyIndex, Session, SessionConfig, SessionId};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use driver::{drive_session, DriverConfig};
use network::LoopbackNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// DKG Party - threshold BLS key generation node
#[derive(Parser)]
#[command(name = "dkg-party")]
#[command(about = "Threshold BLS distributed key generation")]
#[command(version)]
struct Cli {
    /// Data directory for key shares
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run distributed key generation for every party in this process
    Keygen {
        /// Number of parties
        #[arg(short = 'n', long, env = "DKG_PARTIES", default_value_t = bls_dkg_core::DEFAULT_PARTIES)]
        parties: u32,

        /// Threshold; any `threshold + 1` parties can reconstruct
        #[arg(short, long, env = "DKG_THRESHOLD", default_value_t = bls_dkg_core::DEFAULT_THRESHOLD)]
        threshold: usize,

        /// Session identifier (64 hex characters); random if omitted
        #[arg(long)]
        session_id: Option<String>,

        /// Per-party timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show key share info
    Info {
        /// Party index of the saved share
        #[arg(short, long)]
        party: PartyIndex,
    },

    /// Check that saved shares agree and reconstruct the group key
    Verify {
        /// Party indices to combine (comma-separated)
        #[arg(short, long)]
        parties: String,
    },
}

/// On-disk key share
#[derive(Serialize)]
struct SavedShareRef<'a> {
    created_at: DateTime<Utc>,
    version: &'a str,
    share: &'a DkgOutput,
}

#[derive(Deserialize)]
struct SavedShare {
    created_at: DateTime<Utc>,
    version: String,
    share: DkgOutput,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    std::fs::create_dir_all(&cli.dest)
        .with_context(|| format!("creating {}", cli.dest.display()))?;

    match cli.command {
        Commands::Keygen {
            parties,
            threshold,
            ref session_id,
            timeout,
        } => {
            let session_id = match session_id {
                Some(hex) => parse_session_id(hex)?,
                None => random_session_id(),
            };
            let config = DriverConfig {
                timeout: Duration::from_secs(timeout),
                ..DriverConfig::default()
            };
            run_keygen(&cli.dest, session_id, parties, threshold, config).await?;
        }
        Commands::Info { party } => {
            show_info(&cli.dest, party)?;
        }
        Commands::Verify { ref parties } => {
            let parties = parse_parties(parties)?;
            verify_shares(&cli.dest, &parties)?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_keygen(
    dest: &Path,
    session_id: SessionId,
    parties: u32,
    threshold: usize,
    config: DriverConfig,
) -> Result<Vec<Arc<DkgOutput>>> {
    curve::init()?;

    info!(
        session_id = %hex::encode(session_id),
        n_parties = parties,
        threshold,
        "Starting DKG"
    );

    let network = Arc::new(LoopbackNetwork::new());
    let mut sessions = Vec::with_capacity(parties as usize);
    for index in 1..=parties {
        let session_config = SessionConfig::sequential(session_id, index, threshold, parties)?;
        let session = Arc::new(Session::new(session_config)?);
        network.register(Arc::clone(&session));
        sessions.push(session);
    }

    let handles: Vec<_> = sessions
        .iter()
        .map(|session| {
            tokio::spawn(drive_session(
                Arc::clone(session),
                Arc::clone(&network),
                config,
            ))
        })
        .collect();

    let mut outputs = Vec::with_capacity(handles.len());
    let mut failures = 0usize;
    for handle in handles {
        match handle.await? {
            Ok(output) => outputs.push(output),
            Err(e) => {
                error!(error = %e, offender = ?e.offender(), "Party failed");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("DKG failed for {failures} of {parties} parties");
    }

    for output in &outputs {
        let path = save_share(dest, output)?;
        info!(party = output.party_index, path = ?path, "Key share saved");
    }

    if let Some(first) = outputs.first() {
        println!("Group Public Key: {}", first.group_public_key_hex());
    }

    Ok(outputs)
}

fn share_path(dest: &Path, party: PartyIndex) -> PathBuf {
    dest.join(format!("keyshare.{party}.json"))
}

fn save_share(dest: &Path, output: &DkgOutput) -> Result<PathBuf> {
    let path = share_path(dest, output.party_index);
    let saved = SavedShareRef {
        created_at: Utc::now(),
        version: bls_dkg_core::VERSION,
        share: output,
    };
    let json = serde_json::to_string_pretty(&saved)?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn load_share(dest: &Path, party: PartyIndex) -> Result<SavedShare> {
    let path = share_path(dest, party);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let saved: SavedShare = serde_json::from_str(&json)?;
    ensure!(
        saved.share.party_index == party,
        "{} holds the share of party {}",
        path.display(),
        saved.share.party_index
    );
    Ok(saved)
}

fn show_info(dest: &Path, party: PartyIndex) -> Result<()> {
    let saved = load_share(dest, party)?;
    let share = &saved.share;

    println!("Key Share Info:");
    println!("  Party Index: {}", share.party_index);
    println!("  Session ID: {}", hex::encode(share.session_id));
    println!("  Committee: {:?}", share.committee);
    println!("  Threshold: {}", share.threshold);
    println!("  Group Public Key: {}", share.group_public_key_hex());
    if let Some(public_share) = share.public_shares.get(&share.party_index) {
        println!("  Public Share: {}", hex::encode(public_share));
    }
    println!("  Created: {} (v{})", saved.created_at.to_rfc3339(), saved.version);

    Ok(())
}

fn verify_shares(dest: &Path, parties: &[PartyIndex]) -> Result<()> {
    curve::init()?;

    let saved = parties
        .iter()
        .map(|&party| load_share(dest, party))
        .collect::<Result<Vec<_>>>()?;
    let Some(first) = saved.first() else {
        bail!("no parties given");
    };
    let reference = &first.share;

    let mut points = Vec::with_capacity(saved.len());
    for entry in &saved {
        let share = &entry.share;
        ensure!(
            share.session_id == reference.session_id,
            "party {} belongs to another session",
            share.party_index
        );
        ensure!(
            share.group_public_key == reference.group_public_key,
            "party {} disagrees on the group public key",
            share.party_index
        );

        let secret = share
            .secret_scalar()
            .with_context(|| format!("party {} has a malformed secret share", share.party_index))?;
        let own_public = curve::encode_point(&curve::public_key(&secret));
        if share.public_shares.get(&share.party_index).map(Vec::as_slice) != Some(&own_public[..]) {
            warn!(party = share.party_index, "Secret share does not match recorded public share");
            bail!("party {} has an inconsistent public share", share.party_index);
        }
        points.push((share.party_index, secret));
    }

    ensure!(
        points.len() > reference.threshold,
        "need at least {} shares, got {}",
        reference.threshold + 1,
        points.len()
    );

    let secret = vss::interpolate_at_zero(&points).context("duplicate or zero party index")?;
    let reconstructed = curve::encode_point(&curve::public_key(&secret));
    ensure!(
        reconstructed[..] == reference.group_public_key[..],
        "reconstructed key does not match the group public key"
    );

    info!(parties = ?parties, "Shares verified");
    println!("OK: shares reconstruct {}", reference.group_public_key_hex());
    Ok(())
}

fn parse_session_id(hex_str: &str) -> Result<SessionId> {
    hex::decode(hex_str.trim())?
        .try_into()
        .map_err(|_| anyhow::anyhow!("Session ID must be 32 bytes"))
}

fn random_session_id() -> SessionId {
    let mut id = [0u8; 32];
    id[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    id[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    id
}

fn parse_parties(list: &str) -> Result<Vec<PartyIndex>> {
    list.split(',')
        .map(|s| s.trim().parse().with_context(|| format!("invalid party index {s:?}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dkg-party-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fast() -> DriverConfig {
        DriverConfig {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_parse_session_id() {
        let id = parse_session_id(&"ab".repeat(32)).unwrap();
        assert_eq!(id, [0xab; 32]);
        assert!(parse_session_id("abcd").is_err());
        assert!(parse_session_id("zz").is_err());
    }

    #[test]
    fn test_parse_parties() {
        assert_eq!(parse_parties("1, 3,4").unwrap(), vec![1, 3, 4]);
        assert!(parse_parties("1,x").is_err());
    }

    #[test]
    fn test_random_session_ids_differ() {
        assert_ne!(random_session_id(), random_session_id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keygen_save_and_verify() {
        let dest = scratch_dir();
        let outputs = run_keygen(&dest, [9u8; 32], 4, 2, fast()).await.unwrap();
        assert_eq!(outputs.len(), 4);

        let loaded = load_share(&dest, 3).unwrap();
        assert_eq!(loaded.share.group_public_key, outputs[0].group_public_key);
        assert_eq!(loaded.version, bls_dkg_core::VERSION);
        show_info(&dest, 3).unwrap();

        verify_shares(&dest, &[1, 2, 4]).unwrap();
        verify_shares(&dest, &[4, 3, 2, 1]).unwrap();
        // Below the threshold the shares cannot reconstruct.
        assert!(verify_shares(&dest, &[1, 2]).is_err());

        std::fs::remove_dir_all(&dest).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verify_rejects_tampered_share() {
        let dest = scratch_dir();
        run_keygen(&dest, [8u8; 32], 3, 1, fast()).await.unwrap();

        let path = share_path(&dest, 2);
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["share"]["secret_share"][0] = serde_json::json!(7);
        std::fs::write(&path, value.to_string()).unwrap();

        assert!(verify_shares(&dest, &[1, 2]).is_err());
        std::fs::remove_dir_all(&dest).unwrap();
    }

    #[tokio::test]
    async fn test_keygen_rejects_bad_threshold() {
        let dest = scratch_dir();
        assert!(run_keygen(&dest, [1u8; 32], 3, 3, fast()).await.is_err());
        std::fs::remove_dir_all(&dest).unwrap();
    }

    #[test]
    fn test_missing_share_file() {
        let dest = scratch_dir();
        assert!(show_info(&dest, 1).is_err());
        std::fs::remove_dir_all(&dest).unwrap();
    }
}
