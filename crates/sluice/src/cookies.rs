//! Netscape `cookies.txt` loading.
//!
//! Seven tab-separated fields per line:
//! `domain TAB include_subdomains TAB path TAB secure TAB expiration TAB name TAB value`.
//! Comment (`#`) and blank lines are ignored; lines that do not parse are
//! skipped.

use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::Jar;
use tracing::{debug, warn};
use url::Url;

use crate::error::DownloadError;

/// Load a Netscape cookie file into a jar usable as a reqwest cookie
/// provider. Only the `.txt` format is supported; other extensions fail at
/// load.
pub fn jar_from_file(path: &Path) -> Result<Arc<Jar>, DownloadError> {
    let is_txt = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
    if !is_txt {
        return Err(DownloadError::Configuration {
            reason: format!("unsupported cookie file format: {}", path.display()),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let jar = Arc::new(Jar::default());
    let mut loaded = 0usize;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let (domain, path, secure, name, value) =
            (fields[0], fields[2], fields[3] == "TRUE", fields[5], fields[6]);

        let host = domain.trim_start_matches('.');
        let scheme = if secure { "https" } else { "http" };
        let Ok(origin) = Url::parse(&format!("{scheme}://{host}{path}")) else {
            warn!(domain, "skipping cookie with unparseable origin");
            continue;
        };

        let mut cookie = format!("{name}={value}; Domain={domain}; Path={path}");
        if secure {
            cookie.push_str("; Secure");
        }
        jar.add_cookie_str(&cookie, &origin);
        loaded += 1;
    }

    debug!(count = loaded, path = %path.display(), "loaded cookies");
    Ok(jar)
}
