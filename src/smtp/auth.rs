/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{borrow::Cow, fmt::Display};

use serde::Deserialize;
use smtp_proto::{EhloResponse, AUTH_LOGIN, AUTH_NTLM, AUTH_PLAIN};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{encoding, SmtpClient};

use super::{AssertReply, AuthRound, SessionState};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials<'x> {
    username: Cow<'x, str>,
    secret: Cow<'x, str>,
    domain: Cow<'x, str>,
}

impl<'x> From<(&'x str, &'x str)> for Credentials<'x> {
    fn from(credentials: (&'x str, &'x str)) -> Self {
        Credentials::new(credentials.0, credentials.1)
    }
}

impl<'x> From<(String, String)> for Credentials<'x> {
    fn from(credentials: (String, String)) -> Self {
        Credentials::new(credentials.0, credentials.1)
    }
}

impl<'x> std::fmt::Debug for Credentials<'x> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl<'x> Credentials<'x> {
    /// Creates a new `Credentials` instance.
    pub fn new(
        username: impl Into<Cow<'x, str>>,
        secret: impl Into<Cow<'x, str>>,
    ) -> Credentials<'x> {
        Credentials {
            username: username.into(),
            secret: secret.into(),
            domain: Cow::Borrowed(""),
        }
    }

    /// Sets the authentication domain used by challenge-response mechanisms.
    pub fn domain(mut self, domain: impl Into<Cow<'x, str>>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The authentication domain, empty when none was given.
    pub fn auth_domain(&self) -> &str {
        &self.domain
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.secret.is_empty()
    }

    pub(crate) fn encode(&self, mechanism: Mechanism, challenge: &str) -> crate::Result<String> {
        Ok(encoding::encode(
            match mechanism {
                Mechanism::Plain => {
                    format!("\u{0}{}\u{0}{}", self.username, self.secret)
                }

                Mechanism::Login => {
                    let challenge = encoding::decode(challenge)?;
                    let starts_with = |prompt: &[u8]| {
                        challenge
                            .get(..prompt.len())
                            .map_or(false, |head| head.eq_ignore_ascii_case(prompt))
                    };

                    // "username" because Google makes its own standards
                    if starts_with(b"user name") || starts_with(b"username") {
                        &self.username
                    } else if starts_with(b"password") {
                        &self.secret
                    } else {
                        return Err(crate::Error::UnexpectedChallenge);
                    }
                    .to_string()
                }
            }
            .as_bytes(),
        ))
    }
}

/// A multi-round SASL mechanism carried over `AUTH`.
///
/// Implementations produce raw binary payloads, base64 framing is applied by
/// the session.
pub trait ChallengeResponse {
    /// Mechanism name as sent after `AUTH`.
    fn mechanism(&self) -> &str;

    /// Builds the first client payload. Called before anything is written to
    /// the server, so setup errors never leave a half-open exchange.
    fn begin_negotiation(&self, credentials: &Credentials<'_>) -> crate::Result<Vec<u8>>;

    /// Answers the decoded server challenge.
    fn complete_challenge(
        &self,
        challenge: &[u8],
        credentials: &Credentials<'_>,
    ) -> crate::Result<Vec<u8>>;
}

/// Authentication mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mechanism {
    /// Plain
    Plain,

    /// Login
    Login,
}

impl Mechanism {
    /// Picks PLAIN, falling back to LOGIN when that is all the server offers.
    pub fn select(capabilities: &EhloResponse<String>) -> Mechanism {
        if capabilities.auth_mechanisms & AUTH_PLAIN == 0
            && capabilities.auth_mechanisms & AUTH_LOGIN != 0
        {
            Mechanism::Login
        } else {
            Mechanism::Plain
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Plain => write!(f, "PLAIN"),
            Mechanism::Login => write!(f, "LOGIN"),
        }
    }
}

/// How the first challenge-response payload is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthFraming {
    /// `AUTH <mechanism>`, wait for 334, then the payload on its own line.
    #[default]
    Continuation,
    /// `AUTH <mechanism> <payload>` on one line.
    InitialResponse,
}

fn advertised(capabilities: &EhloResponse<String>, mechanism: &str) -> bool {
    let flag = if mechanism.eq_ignore_ascii_case("NTLM") {
        AUTH_NTLM
    } else if mechanism.eq_ignore_ascii_case("PLAIN") {
        AUTH_PLAIN
    } else if mechanism.eq_ignore_ascii_case("LOGIN") {
        AUTH_LOGIN
    } else {
        return true;
    };
    capabilities.auth_mechanisms & flag != 0
}

impl<T: AsyncRead + AsyncWrite + Unpin> SmtpClient<T> {
    /// Authenticates with a challenge-response mechanism such as NTLM.
    ///
    /// Requires an encrypted session whose capabilities were re-announced
    /// with EHLO after the upgrade.
    pub async fn authenticate_challenge_response(
        &mut self,
        authenticator: &impl ChallengeResponse,
        credentials: &Credentials<'_>,
    ) -> crate::Result<()> {
        self.require_auth_ready()?;
        let result = self
            .challenge_response_exchange(authenticator, credentials)
            .await;
        self.track(result)?;
        self.state = SessionState::Authenticated;
        log::info!(
            "Authenticated as {} using {}",
            credentials.username(),
            authenticator.mechanism()
        );
        Ok(())
    }

    async fn challenge_response_exchange(
        &mut self,
        authenticator: &impl ChallengeResponse,
        credentials: &Credentials<'_>,
    ) -> crate::Result<()> {
        let mechanism = authenticator.mechanism();
        if let Some(capabilities) = &self.capabilities {
            if !advertised(capabilities, mechanism) {
                log::warn!(
                    "Server did not advertise AUTH {}, attempting it anyway",
                    mechanism
                );
            }
        }

        let negotiate = encoding::encode(authenticator.begin_negotiation(credentials)?);
        self.state = SessionState::Authenticating(AuthRound::Negotiate);

        let reply = match self.framing {
            AuthFraming::Continuation => {
                self.cmd(format!("AUTH {}\r\n", mechanism))
                    .await?
                    .assert_code(334, crate::Error::AuthenticationFailed)?;
                self.cmd_sensitive(format!("{}\r\n", negotiate)).await?
            }
            AuthFraming::InitialResponse => {
                self.cmd_sensitive(format!("AUTH {} {}\r\n", mechanism, negotiate))
                    .await?
            }
        }
        .assert_code(334, crate::Error::AuthenticationFailed)?;

        self.state = SessionState::Authenticating(AuthRound::Authenticate);
        let authenticate = match encoding::decode(reply.message())
            .and_then(|challenge| authenticator.complete_challenge(&challenge, credentials))
        {
            Ok(authenticate) => encoding::encode(authenticate),
            Err(err) => {
                self.cancel_exchange().await;
                return Err(err);
            }
        };

        self.cmd_sensitive(format!("{}\r\n", authenticate))
            .await?
            .assert_code(235, crate::Error::AuthenticationFailed)?;
        Ok(())
    }

    /// Authenticates with PLAIN, or LOGIN when PLAIN is not offered.
    pub async fn authenticate_plain(&mut self, credentials: &Credentials<'_>) -> crate::Result<()> {
        self.require_auth_ready()?;
        if !credentials.is_complete() {
            return Err(crate::Error::MissingCredentials);
        }
        let mechanism = self
            .capabilities
            .as_ref()
            .map(Mechanism::select)
            .unwrap_or(Mechanism::Plain);
        let result = self.plain_exchange(mechanism, credentials).await;
        self.track(result)?;
        self.state = SessionState::Authenticated;
        log::info!(
            "Authenticated as {} using {}",
            credentials.username(),
            mechanism
        );
        Ok(())
    }

    async fn plain_exchange(
        &mut self,
        mechanism: Mechanism,
        credentials: &Credentials<'_>,
    ) -> crate::Result<()> {
        if let Some(capabilities) = &self.capabilities {
            if !advertised(capabilities, &mechanism.to_string()) {
                log::warn!(
                    "Server did not advertise AUTH {}, attempting it anyway",
                    mechanism
                );
            }
        }

        let mut reply = match mechanism {
            Mechanism::Plain => {
                self.cmd_sensitive(format!("AUTH PLAIN {}\r\n", credentials.encode(mechanism, "")?))
                    .await?
            }
            Mechanism::Login => self.cmd(b"AUTH LOGIN\r\n").await?,
        };

        for _ in 0..3 {
            match reply.code() {
                334 => {
                    let line = match credentials.encode(mechanism, reply.message()) {
                        Ok(line) => line,
                        Err(err) => {
                            self.cancel_exchange().await;
                            return Err(err);
                        }
                    };
                    reply = self.cmd_sensitive(format!("{}\r\n", line)).await?;
                }
                235 => {
                    return Ok(());
                }
                _ => {
                    return Err(crate::Error::AuthenticationFailed(reply));
                }
            }
        }

        Err(crate::Error::AuthenticationFailed(reply))
    }

    fn require_auth_ready(&self) -> crate::Result<()> {
        if self.state != SessionState::EncryptionNegotiated || self.capabilities.is_none() {
            return Err(crate::Error::InvalidState {
                expected: "encrypted and re-announced with EHLO",
                found: self.state.clone(),
            });
        }
        Ok(())
    }

    /// Aborts an `AUTH` exchange that cannot be answered.
    async fn cancel_exchange(&mut self) {
        match self.cmd(b"*\r\n").await {
            Ok(reply) => log::debug!("Authentication cancelled: {}", reply.code()),
            Err(err) => log::debug!("Failed to cancel authentication: {}", err),
        }
    }
}
