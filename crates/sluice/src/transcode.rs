//! Post-download format conversion, delegated to the external `ffmpeg`
//! binary. The engine's contract with the tool is an input path and an
//! output path; everything else is the tool's business.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DownloadError;

const TRANSCODER: &str = "ffmpeg";

/// Convert `input` into `target_format`, removing the original on success.
/// Returns the converted path. A missing binary surfaces as
/// [`DownloadError::DependencyMissing`].
pub async fn convert(input: &Path, target_format: &str) -> Result<PathBuf, DownloadError> {
    let output = input.with_extension(target_format);
    if output == input {
        return Ok(output);
    }
    info!(input = %input.display(), output = %output.display(), "converting format");

    let status = Command::new(TRANSCODER)
        .arg("-i")
        .arg(input)
        .arg("-y")
        .arg(&output)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DownloadError::DependencyMissing {
                binary: TRANSCODER.to_owned(),
            },
            _ => DownloadError::from(e),
        })?;

    if !status.success() {
        return Err(DownloadError::Internal {
            reason: format!("{TRANSCODER} exited with {status}"),
        });
    }

    if let Err(e) = std::fs::remove_file(input) {
        debug!(error = %e, "could not remove pre-conversion file");
    }
    Ok(output)
}
