//! Dump spool command implementation.

use pairsync_engine::spool;
use pairsync_protocol::SyncMessage;
use serde::Serialize;
use std::path::Path;

/// One spooled envelope, summarized for output.
#[derive(Debug, Serialize)]
pub struct SpoolEntryInfo {
    /// Sequence number.
    pub seq: u64,
    /// File name inside the spool directory.
    pub file: String,
    /// Envelope `type`, if the file decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// Record id the envelope is keyed by.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Validation or decoding problem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the dump-spool command.
pub fn run(dir: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("No spool found at {:?}", dir).into());
    }

    let entries: Vec<SpoolEntryInfo> = spool::read_entries(dir)?
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(summarize)
        .collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

fn summarize(entry: spool::SpoolEntry) -> SpoolEntryInfo {
    let file = entry
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut info = SpoolEntryInfo {
        seq: entry.seq,
        file,
        message_type: None,
        dedupe_key: None,
        error: None,
    };

    match entry.envelope {
        Ok(envelope) => {
            info.message_type = envelope.message_type().map(str::to_string);
            match SyncMessage::from_envelope(&envelope) {
                Ok(message) => info.dedupe_key = message.dedupe_key().map(|key| key.to_string()),
                Err(e) => info.error = Some(e.to_string()),
            }
        }
        Err(e) => info.error = Some(e.to_string()),
    }
    info
}

fn print_text_output(entries: &[SpoolEntryInfo]) {
    println!("Spool Entries ({} total)", entries.len());
    println!("================");
    println!();

    for entry in entries {
        print!(
            "[{:08}] {:8}",
            entry.seq,
            entry.message_type.as_deref().unwrap_or("?")
        );
        if let Some(ref key) = entry.dedupe_key {
            print!(" key={}", key);
        }
        if let Some(ref error) = entry.error {
            print!(" error=\"{}\"", error);
        }
        println!();
    }
}
