use std::path::{Path, PathBuf};

use crate::config::DownloadConfig;
use crate::media::Stream;

const DEFAULT_TITLE: &str = "download";
const DEFAULT_FORMAT: &str = "mp4";
const MAX_FILENAME_BYTES: usize = 255;

/// On-disk identity of one download: the canonical output file, its
/// in-progress twin, and the chunk-plan sidecar.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
    pub sidecar_path: PathBuf,
}

impl OutputArtifact {
    pub fn new(final_path: PathBuf) -> Self {
        let temp_path = append_extension(&final_path, "part");
        let sidecar_path = append_extension(&final_path, "progress");
        Self {
            final_path,
            temp_path,
            sidecar_path,
        }
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Replace filesystem-hostile characters, trim leading/trailing dots and
/// spaces, and cap the result at 255 bytes. Idempotent.
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c < ' ' {
            result.push('_');
        } else {
            result.push(c);
        }
    }

    let result = result.trim_matches(|c| c == '.' || c == ' ');
    if result.is_empty() {
        return DEFAULT_TITLE.to_owned();
    }

    if result.len() <= MAX_FILENAME_BYTES {
        return result.to_owned();
    }
    // Cap at 255 bytes without splitting a character.
    let mut end = MAX_FILENAME_BYTES;
    while !result.is_char_boundary(end) {
        end -= 1;
    }
    result[..end]
        .trim_end_matches(|c| c == '.' || c == ' ')
        .to_owned()
}

/// File extension including the dot, or `None`. A leading dot alone does not
/// count (`.hidden` has no extension).
pub fn file_extension(name: &str) -> Option<&str> {
    match name.rfind('.') {
        Some(i) if i > 0 && i < name.len() - 1 => Some(&name[i..]),
        _ => None,
    }
}

/// Output directory for a stream: the `save_as` directory when present
/// (absolute wins, relative joins the configured output path), otherwise the
/// configured output path.
pub fn output_dir(config: &DownloadConfig, stream: &Stream) -> PathBuf {
    if let Some(save_as) = &stream.save_as
        && let Some(dir) = Path::new(save_as).parent()
        && dir != Path::new("")
    {
        if dir.is_absolute() {
            return dir.to_path_buf();
        }
        return config.output_path.join(dir);
    }
    config.output_path.clone()
}

/// Output filename for a stream.
///
/// Precedence: configured `output_name` (extension completed from the stream
/// format), then `save_as` basename, then `sanitized(title).{format}`.
pub fn output_filename(config: &DownloadConfig, stream: &Stream) -> String {
    if let Some(name) = &config.output_name {
        let ext = match file_extension(name) {
            Some(ext) => ext.to_owned(),
            None => {
                let format = non_empty(&stream.format).unwrap_or(DEFAULT_FORMAT);
                format!(".{format}")
            }
        };
        let mut name = name.clone();
        if !name.ends_with(&ext) {
            name.push_str(&ext);
        }
        return sanitize_filename(&name);
    }

    if let Some(save_as) = &stream.save_as
        && let Some(base) = Path::new(save_as).file_name()
    {
        return sanitize_filename(&base.to_string_lossy());
    }

    let title = non_empty(&stream.title).unwrap_or(DEFAULT_TITLE);
    let format = non_empty(&stream.format).unwrap_or(DEFAULT_FORMAT);
    format!("{}.{format}", sanitize_filename(title))
}

/// Full artifact resolution for a stream.
pub fn resolve_output(config: &DownloadConfig, stream: &Stream) -> OutputArtifact {
    let dir = output_dir(config, stream);
    OutputArtifact::new(dir.join(output_filename(config, stream)))
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}
