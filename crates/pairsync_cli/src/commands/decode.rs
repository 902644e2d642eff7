//! Decode command implementation.

use pairsync_protocol::{Envelope, SyncMessage};
use std::fs;
use std::path::Path;
use tracing::info;

/// Runs the decode command.
pub fn run(file: &Path, check: bool) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(file)?;
    let envelope = Envelope::decode(&bytes)?;

    println!("{}", serde_json::to_string_pretty(&envelope)?);

    if check {
        let message = SyncMessage::from_envelope(&envelope)?;
        info!(
            kind = message.kind().as_str(),
            dedupe_key = ?message.dedupe_key(),
            "envelope is a valid sync message"
        );
    }

    Ok(())
}
