use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::warn;

use super::model::{Checkpoint, PhaseStatus};

/// SHA-256 of a file's contents as lowercase hex.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Demote every completed phase whose artifact is missing or changed.
///
/// Returns the names of the demoted phases.
pub fn verify_completed(checkpoint: &mut Checkpoint) -> Vec<String> {
    let mut demoted = Vec::new();

    for (name, record) in checkpoint.phases.iter_mut() {
        if record.status != PhaseStatus::Completed {
            continue;
        }

        let problem = match (&record.artifact_path, &record.artifact_hash) {
            (Some(path), Some(expected)) => match hash_file(path) {
                Ok(actual) if &actual == expected => None,
                Ok(_) => Some(format!("artifact {} changed since completion", path.display())),
                Err(e) => Some(format!("artifact {} unreadable: {}", path.display(), e)),
            },
            _ => Some("no artifact recorded".to_string()),
        };

        if let Some(problem) = problem {
            warn!(phase = %name, "Integrity check failed, re-running phase: {}", problem);
            record.rearm();
            demoted.push(name.clone());
        }
    }

    for name in &demoted {
        checkpoint.warn(format!("Phase {} demoted to pending: artifact integrity check failed", name));
    }
    demoted
}
