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

//! NTLM challenge/response authentication (MS-NLMP).
//!
//! The authenticator is a pure function of its inputs: it produces the
//! NEGOTIATE message from the credentials and the AUTHENTICATE message from
//! the server's CHALLENGE plus the same credentials. Transport framing lives
//! in [`crate::smtp::auth`].

pub mod crypto;
pub mod message;

use std::{
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;

use crate::smtp::auth::{ChallengeResponse, Credentials};

use self::{
    crypto::{desl, hmac_md5, lm_hash, nt_hash, ntlmv2_hash},
    message::{
        Authenticate, Challenge, NEGOTIATE_128, NEGOTIATE_56, NEGOTIATE_ALWAYS_SIGN,
        NEGOTIATE_EXTENDED_SESSIONSECURITY, NEGOTIATE_NTLM, NEGOTIATE_OEM, NEGOTIATE_TARGET_INFO,
        NEGOTIATE_UNICODE, REQUEST_TARGET,
    },
};

/// 1970-01-01 expressed as a FILETIME (100ns ticks since 1601-01-01).
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

pub const DEFAULT_LEVEL: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No user name was provided.
    MissingUsername,
    /// No password was provided.
    MissingSecret,
    /// Compatibility level outside 0..=5.
    UnsupportedLevel(u8),
    /// The challenge does not start with the NTLMSSP signature.
    InvalidSignature,
    /// The challenge carries a message type other than 2.
    UnexpectedMessageType(u32),
    /// The challenge is shorter than its fields claim.
    Truncated,
}

impl Error {
    /// Returns `true` for errors raised before anything is sent, caused by
    /// the local credentials or settings rather than by the server.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::MissingUsername | Error::MissingSecret | Error::UnsupportedLevel(_)
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MissingUsername => write!(f, "Missing user name"),
            Error::MissingSecret => write!(f, "Missing password"),
            Error::UnsupportedLevel(level) => {
                write!(f, "Unsupported NTLM compatibility level {}", level)
            }
            Error::InvalidSignature => write!(f, "Challenge has an invalid signature"),
            Error::UnexpectedMessageType(t) => {
                write!(f, "Expected a challenge message, got type {}", t)
            }
            Error::Truncated => write!(f, "Challenge message is truncated"),
        }
    }
}

impl std::error::Error for Error {}

/// NTLM authenticator.
///
/// The compatibility level selects the responses sent to the server:
///
/// - 0: LM and NTLMv1 responses.
/// - 1: NTLMv1 with extended session security when the server agrees to it,
///   otherwise as level 0.
/// - 2: the NTLMv1 response in both fields, with extended session security
///   when the server agrees to it.
/// - 3 to 5: LMv2 and NTLMv2 responses.
#[derive(Debug, Clone)]
pub struct NtlmAuthenticator {
    level: u8,
    workstation: String,
}

/// Per-attempt client randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientNonce {
    pub challenge: [u8; 8],
    pub timestamp: u64,
}

impl ClientNonce {
    pub fn generate() -> Self {
        let mut challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut challenge);

        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        ClientNonce {
            challenge,
            timestamp: FILETIME_UNIX_EPOCH + (since_epoch.as_nanos() / 100) as u64,
        }
    }
}

impl Default for NtlmAuthenticator {
    fn default() -> Self {
        NtlmAuthenticator {
            level: DEFAULT_LEVEL,
            workstation: String::new(),
        }
    }
}

impl NtlmAuthenticator {
    /// Creates an authenticator for the given compatibility level.
    pub fn new(level: u8) -> crate::Result<Self> {
        if level > 5 {
            return Err(Error::UnsupportedLevel(level).into());
        }
        Ok(NtlmAuthenticator {
            level,
            ..Default::default()
        })
    }

    /// Sets the workstation name announced to the server.
    pub fn workstation(mut self, workstation: impl Into<String>) -> Self {
        self.workstation = workstation.into();
        self
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    fn client_flags(&self) -> u32 {
        let flags = NEGOTIATE_UNICODE
            | NEGOTIATE_OEM
            | REQUEST_TARGET
            | NEGOTIATE_NTLM
            | NEGOTIATE_ALWAYS_SIGN
            | NEGOTIATE_128
            | NEGOTIATE_56;

        if self.level > 0 {
            flags | NEGOTIATE_EXTENDED_SESSIONSECURITY
        } else {
            flags
        }
    }

    pub(crate) fn authenticate(
        &self,
        challenge: &[u8],
        credentials: &Credentials<'_>,
        nonce: &ClientNonce,
    ) -> Result<Vec<u8>, Error> {
        let (username, secret) = validate(credentials)?;
        let domain = credentials.auth_domain();
        let challenge = Challenge::parse(challenge)?;

        let mut flags = challenge.flags & (self.client_flags() | NEGOTIATE_TARGET_INFO);
        if flags & NEGOTIATE_UNICODE != 0 {
            flags &= !NEGOTIATE_OEM;
        }

        let server_challenge = &challenge.server_challenge;
        let (lm_response, nt_response) = match self.level {
            0..=2 if flags & NEGOTIATE_EXTENDED_SESSIONSECURITY != 0 => {
                let mut lm_response = vec![0u8; 24];
                lm_response[..8].copy_from_slice(&nonce.challenge);

                let digest = md5::compute([&server_challenge[..], &nonce.challenge[..]].concat());
                let mut session_challenge = [0u8; 8];
                session_challenge.copy_from_slice(&digest.0[..8]);

                (
                    lm_response,
                    desl(&nt_hash(secret), &session_challenge).to_vec(),
                )
            }
            0..=2 => {
                let nt_response = desl(&nt_hash(secret), server_challenge);
                let lm_response = if self.level == 2 {
                    nt_response
                } else {
                    desl(&lm_hash(secret), server_challenge)
                };
                (lm_response.to_vec(), nt_response.to_vec())
            }
            _ => {
                let hash = ntlmv2_hash(username, secret, domain);
                let server_time = challenge.timestamp()?;

                let mut temp = Vec::with_capacity(32 + challenge.target_info.len());
                temp.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
                temp.extend_from_slice(&server_time.unwrap_or(nonce.timestamp).to_le_bytes());
                temp.extend_from_slice(&nonce.challenge);
                temp.extend_from_slice(&[0u8; 4]);
                temp.extend_from_slice(&challenge.target_info);
                temp.extend_from_slice(&[0u8; 4]);

                let mut nt_response =
                    hmac_md5(&hash, &[&server_challenge[..], &temp].concat()).to_vec();
                nt_response.extend_from_slice(&temp);

                // A server that sends its own time expects no LMv2 response.
                let lm_response = if server_time.is_some() {
                    vec![0u8; 24]
                } else {
                    let mut lm_response =
                        hmac_md5(&hash, &[&server_challenge[..], &nonce.challenge[..]].concat())
                            .to_vec();
                    lm_response.extend_from_slice(&nonce.challenge);
                    lm_response
                };

                (lm_response, nt_response)
            }
        };

        Ok(Authenticate {
            flags,
            lm_response: &lm_response,
            nt_response: &nt_response,
            domain,
            username,
            workstation: &self.workstation,
        }
        .write_to_vec())
    }
}

impl ChallengeResponse for NtlmAuthenticator {
    fn mechanism(&self) -> &str {
        "NTLM"
    }

    fn begin_negotiation(&self, credentials: &Credentials<'_>) -> crate::Result<Vec<u8>> {
        validate(credentials)?;
        Ok(message::negotiate(
            self.client_flags(),
            credentials.auth_domain(),
            &self.workstation,
        ))
    }

    fn complete_challenge(
        &self,
        challenge: &[u8],
        credentials: &Credentials<'_>,
    ) -> crate::Result<Vec<u8>> {
        self.authenticate(challenge, credentials, &ClientNonce::generate())
            .map_err(Into::into)
    }
}

fn validate<'y>(credentials: &'y Credentials<'_>) -> Result<(&'y str, &'y str), Error> {
    if credentials.username().is_empty() {
        Err(Error::MissingUsername)
    } else if credentials.secret().is_empty() {
        Err(Error::MissingSecret)
    } else {
        Ok((credentials.username(), credentials.secret()))
    }
}
