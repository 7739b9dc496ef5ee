// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The two illustrative authentication schemes named in the external interfaces table:
//! `"basic"` (single-round, password carried as base64 in `CONNECT`) and `"login"`
//! (two-round, via `AUTH`/`ContinueAuthentication`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use codec::v5;

use crate::config::{BasicAuthConfig, LoginAuthConfig};

pub(crate) fn find_authentication_method(properties: &v5::Properties) -> Option<&str> {
    properties.props().iter().find_map(|prop| match prop {
        v5::Property::AuthenticationMethod(method) => Some(method.as_ref()),
        _ => None,
    })
}

pub(crate) fn find_authentication_data(properties: &v5::Properties) -> Option<&[u8]> {
    properties.props().iter().find_map(|prop| match prop {
        v5::Property::AuthenticationData(data) => Some(data.as_ref()),
        _ => None,
    })
}

/// Outcome of processing one step of an authentication exchange.
pub enum AuthOutcome {
    /// Handshake may proceed to `CONNACK(Success)`.
    Granted,
    /// Handshake must fail with `CONNACK(NotAuthorized)`.
    Denied,
    /// Broker must reply `AUTH(ContinueAuthentication)` and wait for a follow-up `AUTH` packet.
    Continue,
}

/// Evaluate the `AuthenticationMethod`/`AuthenticationData` carried on a `CONNECT` packet.
///
/// Returns `None` when no method is present (anonymous connect, left to the caller's own
/// `allow_empty_client_id`-style policy).
pub fn authenticate_connect(
    properties: &v5::Properties,
    basic: Option<&BasicAuthConfig>,
    login: Option<&LoginAuthConfig>,
) -> Option<AuthOutcome> {
    let method = find_authentication_method(properties)?;
    match method {
        "basic" => {
            let Some(basic) = basic else {
                return Some(AuthOutcome::Denied);
            };
            let Some(data) = find_authentication_data(properties) else {
                return Some(AuthOutcome::Denied);
            };
            Some(check_basic(data, basic))
        }
        "login" => {
            // First round only carries the username; the broker must continue to a second AUTH.
            if login.is_some() {
                Some(AuthOutcome::Continue)
            } else {
                Some(AuthOutcome::Denied)
            }
        }
        _ => Some(AuthOutcome::Denied),
    }
}

/// Evaluate the second-round `AUTH` packet of a `"login"` exchange.
///
/// `username` is the `AuthenticationData` carried by the initiating `CONNECT`; `password` is the
/// `AuthenticationData` of this follow-up `AUTH`.
#[must_use]
pub fn authenticate_login(username: &[u8], password: &[u8], login: &LoginAuthConfig) -> AuthOutcome {
    if username == login.username.as_bytes() && password == login.password.as_bytes() {
        AuthOutcome::Granted
    } else {
        AuthOutcome::Denied
    }
}

fn check_basic(data: &[u8], basic: &BasicAuthConfig) -> AuthOutcome {
    let Ok(decoded) = BASE64.decode(data) else {
        return AuthOutcome::Denied;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return AuthOutcome::Denied;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return AuthOutcome::Denied;
    };
    if user == basic.username && pass == basic.password {
        AuthOutcome::Granted
    } else {
        AuthOutcome::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::{authenticate_connect, check_basic, AuthOutcome};
    use crate::config::BasicAuthConfig;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use codec::v5;

    fn basic_config() -> BasicAuthConfig {
        BasicAuthConfig {
            username: "user".to_owned(),
            password: "pass".to_owned(),
        }
    }

    #[test]
    fn test_basic_auth_success() {
        let data = BASE64.encode("user:pass");
        let outcome = check_basic(data.as_bytes(), &basic_config());
        assert!(matches!(outcome, AuthOutcome::Granted));
    }

    #[test]
    fn test_basic_auth_wrong_password() {
        let data = BASE64.encode("user:wrong");
        let outcome = check_basic(data.as_bytes(), &basic_config());
        assert!(matches!(outcome, AuthOutcome::Denied));
    }

    #[test]
    fn test_no_authentication_method_is_none() {
        let properties = v5::Properties::new();
        let outcome = authenticate_connect(&properties, Some(&basic_config()), None);
        assert!(outcome.is_none());
    }
}
