//! SASL mechanism selection and exchanges.
//!
//! Selection is a pure function of the configured [`AuthType`], the
//! mechanisms the server advertised and whether the channel is encrypted.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::command::Command;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::settings::AuthType;
use crate::types::AuthMechanism;

type HmacMd5 = Hmac<Md5>;

/// Returns true if credentials may be sent in recoverable form.
///
/// Only the legacy automatic mode refuses clear-text mechanisms on an
/// unencrypted channel; explicit PLAIN/LOGIN is the user's decision.
#[must_use]
pub const fn cleartext_permitted(auth_type: AuthType, secure: bool) -> bool {
    !matches!(auth_type, AuthType::Automatic) || secure
}

/// Returns true if the mechanism exposes the password to an eavesdropper.
#[must_use]
pub const fn is_cleartext(mechanism: AuthMechanism) -> bool {
    matches!(mechanism, AuthMechanism::Plain | AuthMechanism::Login)
}

/// Mechanisms acceptable for a policy, most preferred first.
#[must_use]
pub const fn preference(auth_type: AuthType) -> &'static [AuthMechanism] {
    match auth_type {
        AuthType::Plain | AuthType::Login => &[AuthMechanism::Plain, AuthMechanism::Login],
        AuthType::CramMd5 => &[AuthMechanism::CramMd5],
        AuthType::Automatic => &[
            AuthMechanism::Plain,
            AuthMechanism::Login,
            AuthMechanism::CramMd5,
        ],
    }
}

/// Picks the mechanism to authenticate with.
///
/// # Errors
///
/// Returns [`Error::InsecureAutoAuth`] when automatic mode finds only
/// clear-text mechanisms on an unencrypted channel, and
/// [`Error::AuthUnavailable`] when nothing acceptable is advertised.
pub fn select_mechanism(
    auth_type: AuthType,
    advertised: &[AuthMechanism],
    secure: bool,
) -> Result<AuthMechanism> {
    let cleartext_ok = cleartext_permitted(auth_type, secure);
    let chosen = preference(auth_type)
        .iter()
        .copied()
        .filter(|m| cleartext_ok || !is_cleartext(*m))
        .find(|m| advertised.contains(m));

    if let Some(mechanism) = chosen {
        return Ok(mechanism);
    }

    Err(match auth_type {
        AuthType::Automatic if !secure => Error::InsecureAutoAuth,
        AuthType::Automatic => {
            Error::AuthUnavailable("No supported authentication methods available.".into())
        }
        AuthType::Plain | AuthType::Login => Error::AuthUnavailable(
            "Authentication methods SASL PLAIN and LOGIN are unavailable.".into(),
        ),
        AuthType::CramMd5 => {
            Error::AuthUnavailable("Authentication method CRAM-MD5 is unavailable.".into())
        }
    })
}

/// Builds the SASL PLAIN initial response.
#[must_use]
pub fn plain_response(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{username}\0{password}"))
}

/// Answers a CRAM-MD5 challenge (RFC 2195).
///
/// # Errors
///
/// Returns [`Error::NegotiationFailed`] if the challenge is not base64.
pub fn cram_md5_response(username: &str, password: &str, challenge_b64: &str) -> Result<String> {
    let challenge = BASE64
        .decode(challenge_b64.trim())
        .map_err(|e| Error::NegotiationFailed(format!("Invalid CRAM-MD5 challenge: {e}")))?;

    let mut mac = HmacMd5::new_from_slice(password.as_bytes())
        .map_err(|e| Error::NegotiationFailed(format!("HMAC error: {e}")))?;
    mac.update(&challenge);
    let digest = mac.finalize().into_bytes();

    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(BASE64.encode(format!("{username} {hex}")))
}

/// Runs the exchange for `mechanism`.
///
/// # Errors
///
/// Returns [`Error::AuthenticationFailed`] when the server rejects the
/// credentials, or the underlying error for anything else.
pub async fn authenticate<S>(
    conn: &mut Connection<S>,
    mechanism: AuthMechanism,
    username: &str,
    password: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!("Authenticating with {mechanism}");
    match mechanism {
        AuthMechanism::Plain => auth_plain(conn, username, password)
            .await
            .map_err(|e| reclassify(mechanism, e)),
        AuthMechanism::Login => auth_login(conn, username, password)
            .await
            .map_err(|e| reclassify(mechanism, e)),
        AuthMechanism::CramMd5 => auth_cram_md5(conn, username, password).await,
    }
}

async fn auth_plain<S>(conn: &mut Connection<S>, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.execute(&Command::Auth {
        mechanism: AuthMechanism::Plain,
        initial_response: Some(plain_response(username, password)),
    })
    .await?;
    Ok(())
}

async fn auth_login<S>(conn: &mut Connection<S>, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.execute(&Command::Auth {
        mechanism: AuthMechanism::Login,
        initial_response: None,
    })
    .await?;
    conn.execute(&Command::AuthResponse(BASE64.encode(username)))
        .await?;
    conn.execute(&Command::AuthResponse(BASE64.encode(password)))
        .await?;
    Ok(())
}

async fn auth_cram_md5<S>(conn: &mut Connection<S>, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = conn
        .execute(&Command::Auth {
            mechanism: AuthMechanism::CramMd5,
            initial_response: None,
        })
        .await?;

    let [challenge] = reply.lines.as_slice() else {
        return Err(Error::NegotiationFailed(
            "Unable to negotiate CRAM-MD5".into(),
        ));
    };

    let response = cram_md5_response(username, password, challenge)?;
    match conn.execute(&Command::AuthResponse(response)).await {
        Ok(_) => Ok(()),
        Err(Error::NegativeReply { code, text }) => Err(Error::AuthenticationFailed(format!(
            "AUTH CRAM-MD5 failed ({code} {text})"
        ))),
        Err(e) => Err(e),
    }
}

/// Turns an authentication-family rejection into [`Error::AuthenticationFailed`].
fn reclassify(mechanism: AuthMechanism, err: Error) -> Error {
    if !err.is_auth_reply() {
        return err;
    }
    match err {
        Error::NegativeReply { code, text } => {
            Error::AuthenticationFailed(format!("AUTH {mechanism} failed ({code} {text})"))
        }
        other => other,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::io::Builder;

    use AuthMechanism::{CramMd5, Login, Plain};

    fn conn(mock: tokio_test::io::Mock) -> Connection<tokio_test::io::Mock> {
        Connection::new(mock, Duration::from_secs(5))
    }

    #[test]
    fn test_select_plain_policy() {
        assert_eq!(
            select_mechanism(AuthType::Plain, &[Login, Plain], false).unwrap(),
            Plain
        );
        assert_eq!(
            select_mechanism(AuthType::Login, &[Login], false).unwrap(),
            Login
        );
        assert!(matches!(
            select_mechanism(AuthType::Plain, &[CramMd5], true),
            Err(Error::AuthUnavailable(_))
        ));
    }

    #[test]
    fn test_select_cram_md5_policy() {
        assert_eq!(
            select_mechanism(AuthType::CramMd5, &[Plain, CramMd5], false).unwrap(),
            CramMd5
        );
        assert!(matches!(
            select_mechanism(AuthType::CramMd5, &[Plain, Login], true),
            Err(Error::AuthUnavailable(_))
        ));
    }

    #[test]
    fn test_select_automatic_secure() {
        assert_eq!(
            select_mechanism(AuthType::Automatic, &[Login, CramMd5], true).unwrap(),
            Login
        );
        assert_eq!(
            select_mechanism(AuthType::Automatic, &[CramMd5], true).unwrap(),
            CramMd5
        );
        assert!(matches!(
            select_mechanism(AuthType::Automatic, &[], true),
            Err(Error::AuthUnavailable(_))
        ));
    }

    #[test]
    fn test_select_automatic_insecure_refuses_cleartext() {
        assert!(matches!(
            select_mechanism(AuthType::Automatic, &[Login, Plain], false),
            Err(Error::InsecureAutoAuth)
        ));
        assert_eq!(
            select_mechanism(AuthType::Automatic, &[Plain, CramMd5], false).unwrap(),
            CramMd5
        );
    }

    #[test]
    fn test_plain_response() {
        assert_eq!(plain_response("user", "pass"), "AHVzZXIAcGFzcw==");
    }

    #[test]
    fn test_cram_md5_rfc2195_vector() {
        let response = cram_md5_response(
            "tim",
            "tanstaaftanstaaf",
            "PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2UucmVzdG9uLm1jaS5uZXQ+",
        )
        .unwrap();
        assert_eq!(response, "dGltIGI5MTNhNjAyYzdlZGE3YTQ5NWI0ZTZlNzMzNGQzODkw");
    }

    #[test]
    fn test_cram_md5_bad_challenge() {
        assert!(matches!(
            cram_md5_response("tim", "pw", "not base64!"),
            Err(Error::NegotiationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_plain_exchange() {
        let mock = Builder::new()
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"235 2.7.0 Authentication successful\r\n")
            .build();
        authenticate(&mut conn(mock), Plain, "user", "pass")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_auth_plain_rejected_is_authentication_failed() {
        let mock = Builder::new()
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"535 5.7.8 Authentication credentials invalid\r\n")
            .build();
        let err = authenticate(&mut conn(mock), Plain, "user", "pass")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_auth_plain_other_failure_propagates() {
        let mock = Builder::new()
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"454 4.7.0 Temporary failure\r\n")
            .build();
        let err = authenticate(&mut conn(mock), Plain, "user", "pass")
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), Some(454));
    }

    #[tokio::test]
    async fn test_auth_login_exchange() {
        let mock = Builder::new()
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"dXNlcg==\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"cGFzcw==\r\n")
            .read(b"235 ok\r\n")
            .build();
        authenticate(&mut conn(mock), Login, "user", "pass")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_auth_login_password_rejected_is_authentication_failed() {
        let mock = Builder::new()
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"dXNlcg==\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"cGFzcw==\r\n")
            .read(b"535 5.7.8 Authentication credentials invalid\r\n")
            .build();
        let err = authenticate(&mut conn(mock), Login, "user", "pass")
            .await
            .unwrap_err();
        match err {
            Error::AuthenticationFailed(message) => {
                assert_eq!(
                    message,
                    "AUTH LOGIN failed (535 5.7.8 Authentication credentials invalid)"
                );
            }
            other => panic!("Expected AuthenticationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_login_other_failure_propagates() {
        let mock = Builder::new()
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"dXNlcg==\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"cGFzcw==\r\n")
            .read(b"454 4.7.0 Temporary authentication failure\r\n")
            .build();
        let err = authenticate(&mut conn(mock), Login, "user", "pass")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NegativeReply { code: 454, ref text }
                if text == "4.7.0 Temporary authentication failure"
        ));
    }

    #[tokio::test]
    async fn test_auth_cram_md5_exchange() {
        let mock = Builder::new()
            .write(b"AUTH CRAM-MD5\r\n")
            .read(b"334 PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2UucmVzdG9uLm1jaS5uZXQ+\r\n")
            .write(b"dGltIGI5MTNhNjAyYzdlZGE3YTQ5NWI0ZTZlNzMzNGQzODkw\r\n")
            .read(b"235 ok\r\n")
            .build();
        authenticate(&mut conn(mock), CramMd5, "tim", "tanstaaftanstaaf")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_auth_cram_md5_without_challenge() {
        let mock = Builder::new()
            .write(b"AUTH CRAM-MD5\r\n")
            .read(b"334\r\n")
            .build();
        let err = authenticate(&mut conn(mock), CramMd5, "tim", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed(_)));
    }

    #[tokio::test]
    async fn test_auth_cram_md5_rejected() {
        let mock = Builder::new()
            .write(b"AUTH CRAM-MD5\r\n")
            .read(b"334 PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2UucmVzdG9uLm1jaS5uZXQ+\r\n")
            .write(b"dGltIGI5MTNhNjAyYzdlZGE3YTQ5NWI0ZTZlNzMzNGQzODkw\r\n")
            .read(b"501 5.5.4 nope\r\n")
            .build();
        let err = authenticate(&mut conn(mock), CramMd5, "tim", "tanstaaftanstaaf")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }
}
