// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::EncodeError;

/// Generate a random alphanumeric string of length `len`.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(len)
        .collect()
}

/// Generate a random client identifier suitable for an empty-client-id `CONNECT`.
#[must_use]
pub fn random_client_id() -> String {
    format!("auto-{}", random_string(16))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// String exceeds the 65,535 byte two-byte-length-prefix limit.
    TooLong,

    /// String contains the null character U+0000.
    NullCharacter,

    /// Byte slice is not valid UTF-8.
    InvalidUtf8,
}

/// Decode a raw byte slice as a UTF-8 string, per the MQTT "UTF-8 Encoded String" rules.
///
/// # Errors
///
/// Returns error if `bytes` is not well-formed UTF-8 or contains U+0000.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_err| StringError::InvalidUtf8)?;
    validate_utf8_string(s)?;
    Ok(s.to_string())
}

/// Validate that `s` is acceptable as an MQTT UTF-8 Encoded String.
///
/// # Errors
///
/// Returns error if `s` is longer than 65,535 bytes when encoded as UTF-8, or if it
/// contains the null character U+0000.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooLong);
    }
    if s.contains('\u{0000}') {
        return Err(StringError::NullCharacter);
    }
    Ok(())
}

/// Validate that `data` fits within the two-byte length prefix used for Binary Data.
///
/// # Errors
///
/// Returns error if `data` is longer than 65,535 bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > usize::from(u16::MAX) {
        return Err(EncodeError::TooManyData);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    TooLong,
}

/// Validate a client identifier supplied in a `CONNECT` packet.
///
/// MQTT 5 lifts the MQTT 3.1.1 restriction to 23 characters of `[0-9a-zA-Z]`; a Server
/// MAY allow any UTF-8 Encoded String, subject only to the two-byte length limit already
/// enforced by [`validate_utf8_string`]. This broker follows that relaxed rule.
///
/// # Errors
///
/// Returns error if `client_id` exceeds the 65,535 byte limit.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > usize::from(u16::MAX) {
        return Err(ClientIdError::TooLong);
    }
    Ok(())
}
