//! AES-128-CBC segment decryption: key fetching with retry and caching, IV
//! parsing and derivation, block decryption, and strict PKCS#7 stripping.

use std::time::Duration;

use aes::Aes128;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::cache::{CacheKey, CacheResourceType};
use crate::client::HttpClient;
use crate::error::{DownloadError, is_retryable_status};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const KEY_TTL: Duration = Duration::from_secs(60 * 60);
pub(crate) const AES_BLOCK: usize = 16;

/// Fetches raw AES keys with retry, caching them by URI so a key shared by a
/// run of segments is downloaded once.
pub(crate) struct KeyFetcher {
    client: HttpClient,
    policy: RetryPolicy,
    token: CancellationToken,
    /// Serializes cache-miss fetches so one rotation costs one key GET no
    /// matter how many segments race for it.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl KeyFetcher {
    pub fn new(client: HttpClient, policy: RetryPolicy, token: CancellationToken) -> Self {
        Self {
            client,
            policy,
            token,
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn fetch_key(&self, uri: &Url) -> Result<[u8; 16], DownloadError> {
        let cache_key = CacheKey::new(CacheResourceType::Key, uri.as_str());
        if let Some(cached) = self.client.cache().get(&cache_key).await
            && let Ok(key) = <[u8; 16]>::try_from(cached.as_ref())
        {
            return Ok(key);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(cached) = self.client.cache().get(&cache_key).await
            && let Ok(key) = <[u8; 16]>::try_from(cached.as_ref())
        {
            return Ok(key);
        }

        let client = &self.client;
        let bytes = retry_with_backoff(&self.policy, &self.token, |_| async move {
            let response = match client.get(uri.as_str(), &HeaderMap::new()).send().await {
                Ok(response) => response,
                Err(e) => return RetryAction::from_error(e.into()),
            };
            let status = response.status();
            if status != StatusCode::OK {
                return RetryAction::from_error(DownloadError::SegmentFetch {
                    reason: format!("HTTP {status} fetching key from {uri}"),
                    retryable: is_retryable_status(status),
                });
            }
            match response.bytes().await {
                Ok(bytes) => RetryAction::Success(bytes),
                Err(e) => RetryAction::from_error(e.into()),
            }
        })
        .await?;

        if bytes.len() != AES_BLOCK {
            return Err(DownloadError::decryption(format!(
                "key from {uri} has incorrect length: {} bytes (expected 16)",
                bytes.len()
            )));
        }
        let key = <[u8; 16]>::try_from(bytes.as_ref()).expect("length checked");
        self.client.cache().put(cache_key, bytes, KEY_TTL).await;
        debug!(uri = %uri, "fetched decryption key");
        Ok(key)
    }
}

/// Parse a playlist IV attribute: 32 hex digits with an optional `0x` prefix.
pub(crate) fn parse_iv(iv: &str) -> Result<[u8; 16], DownloadError> {
    let hex_str = iv.trim_start_matches("0x").trim_start_matches("0X");
    let mut out = [0u8; 16];
    hex::decode_to_slice(hex_str, &mut out)
        .map_err(|e| DownloadError::decryption(format!("failed to parse IV `{iv}`: {e}")))?;
    Ok(out)
}

/// IV for a segment whose key tag carries none: the media sequence number,
/// big-endian, in the low 8 bytes of a zeroed 16-byte block (RFC 8216 §5.2).
pub(crate) fn iv_from_sequence(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Decrypt a full segment in place and strip its PKCS#7 padding. The
/// ciphertext must be block-aligned.
pub(crate) fn decrypt_segment(
    data: Vec<u8>,
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>, DownloadError> {
    if data.len() % AES_BLOCK != 0 {
        return Err(DownloadError::decryption(format!(
            "ciphertext length {} is not a multiple of the AES block size",
            data.len()
        )));
    }
    let mut buffer = data;
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| DownloadError::decryption(format!("failed to initialize decryptor: {e}")))?;
    decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| DownloadError::decryption(format!("decryption failed: {e}")))?;
    Ok(strip_pkcs7(buffer))
}

/// Strip PKCS#7 padding iff the final byte is in `[1, 16]` and every
/// trailing padding byte equals it; otherwise the data is returned unchanged.
pub(crate) fn strip_pkcs7(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad = last as usize;
    if pad == 0 || pad > AES_BLOCK || pad > data.len() {
        return data;
    }
    if data[data.len() - pad..].iter().all(|&b| b == last) {
        data.truncate(data.len() - pad);
    }
    data
}
