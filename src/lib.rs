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

//! # relay-send
//!
//! _relay-send_ delivers a message to an SMTP relay that requires
//! authentication. It includes the following features:
//!
//! - Simple Mail Transfer Protocol (**SMTP**; _RFC 5321_) submission.
//! - Mandatory upgrade to **TLS** with STARTTLS (_RFC 3207_) before any
//!   credentials are sent.
//! - SMTP Service Extension for Authentication (_RFC 4954_) with:
//!   - NTLM (_MS-NLMP_), LM/NTLMv1/NTLMv2 selected by compatibility level
//!   - PLAIN
//!   - LOGIN
//! - **MIME** (_RFC 2045 - 2049_) multipart messages with binary attachments.
//! - Full async (requires Tokio).
//!
//! ## Usage Example
//!
//! Drive a session by hand:
//!
//! ```rust
//!     let envelope = Envelope::builder()
//!         .from("john@example.com")
//!         .to(["jane@example.com"])
//!         .subject("Hi!")
//!         .body("Hello world!")
//!         .attachment_path("./report.pdf")
//!         .build()
//!         .unwrap();
//!
//!     let builder = SmtpClientBuilder::new("mail.example.com", 587);
//!     let mut client = builder.connect().await.unwrap();
//!     client.ehlo(&builder.local_host).await.unwrap();
//!     client.start_tls().await.unwrap();
//!     let mut client = client
//!         .into_tls(&builder.tls_connector, "mail.example.com")
//!         .await
//!         .unwrap();
//!     client.ehlo(&builder.local_host).await.unwrap();
//!     client
//!         .authenticate_challenge_response(
//!             &NtlmAuthenticator::default(),
//!             &Credentials::new("john", "p4ssw0rd").domain("CORP"),
//!         )
//!         .await
//!         .unwrap();
//!     client.submit(&envelope).await.unwrap();
//!     client.close().await;
//! ```
//!
//! Or let [`Delivery`] run the whole pipeline from a [`DeliveryConfig`]:
//!
//! ```rust
//!     let config = DeliveryConfig::from_file("email_config.json").unwrap();
//!     match Delivery::new(config).send().await {
//!         Ok(delivered) => println!("Sent to {} recipients", delivered.recipients),
//!         Err(failure) => eprintln!("{}", failure),
//!     }
//! ```

pub mod config;
pub mod delivery;
pub mod encoding;
pub mod mime;
pub mod ntlm;
pub mod smtp;

use std::{fmt::Display, time::Duration};

use smtp::{auth::AuthFraming, SessionState};
use smtp_proto::{EhloResponse, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

pub use config::{DeliveryConfig, EnvSecret, SecretProvider};
pub use delivery::{Delivered, Delivery, Failure};
pub use mail_builder;
pub use mime::{Attachment, AttachmentError, Envelope, EnvelopeBuilder};
pub use ntlm::NtlmAuthenticator;
pub use smtp::auth::{ChallengeResponse, Credentials};
pub use smtp::tls::TlsUpgrade;
pub use smtp_proto;

#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// TLS error
    Tls(Box<rustls::Error>),

    /// Base64 decode error
    Base64(base64::DecodeError),

    /// NTLM negotiation error
    Ntlm(ntlm::Error),

    /// Invalid delivery configuration
    Config(String),

    /// Could not open a connection to the server
    Connect(std::io::Error),

    /// Failure parsing SMTP reply
    UnparseableReply,

    /// The server refused the session in its greeting
    GreetingRejected(Response<String>),

    /// Unexpected SMTP reply.
    UnexpectedReply(Response<String>),

    /// The server refused to start TLS
    StartTlsRefused(Response<String>),

    /// The server's authentication challenge could not be answered.
    UnexpectedChallenge,

    /// SMTP authentication failure.
    AuthenticationFailed(Response<String>),

    /// The server refused the message or one of its envelope addresses
    SubmissionRejected(Response<String>),

    /// Invalid TLS name provided.
    InvalidTLSName,

    /// Missing authentication credentials.
    MissingCredentials,

    /// Missing message sender.
    MissingMailFrom,

    /// Missing message recipients.
    MissingRcptTo,

    /// The operation is not valid in the current session state.
    InvalidState {
        expected: &'static str,
        found: SessionState,
    },

    /// Connection timeout.
    Timeout,
}

/// Failure categories reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid configuration, nothing was sent.
    Config,
    /// DNS, connect, transport or timeout failure.
    Connection,
    /// The server answered with an unexpected reply outside authentication
    /// and submission.
    Protocol,
    /// The credentials or authenticator settings are incomplete.
    AuthSetup,
    /// The server's authentication challenge could not be processed.
    AuthProtocol,
    /// The server rejected the credentials.
    Authentication,
    /// The server rejected the message.
    Submission,
    /// A session operation was called out of order.
    State,
    /// An attachment file could not be read and was skipped.
    Attachment,
}

pub type Result<T> = std::result::Result<T, Error>;

/// SMTP client session.
pub struct SmtpClient<T: AsyncRead + AsyncWrite> {
    pub stream: T,
    pub timeout: Duration,
    pub(crate) state: SessionState,
    pub(crate) capabilities: Option<EhloResponse<String>>,
    pub(crate) framing: AuthFraming,
    pub(crate) tls_accepted: bool,
}

#[derive(Clone)]
pub struct SmtpClientBuilder<T: AsRef<str> + PartialEq + Eq> {
    pub timeout: Duration,
    pub tls_connector: TlsConnector,
    pub tls_hostname: T,
    pub framing: AuthFraming,
    pub addr: String,
    pub local_host: String,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::MissingMailFrom | Error::MissingRcptTo => ErrorKind::Config,
            Error::Io(_) | Error::Tls(_) | Error::Connect(_) | Error::Timeout => {
                ErrorKind::Connection
            }
            Error::UnparseableReply
            | Error::GreetingRejected(_)
            | Error::UnexpectedReply(_)
            | Error::StartTlsRefused(_)
            | Error::InvalidTLSName => ErrorKind::Protocol,
            Error::MissingCredentials => ErrorKind::AuthSetup,
            Error::Ntlm(err) if err.is_setup() => ErrorKind::AuthSetup,
            Error::Ntlm(_) | Error::Base64(_) | Error::UnexpectedChallenge => {
                ErrorKind::AuthProtocol
            }
            Error::AuthenticationFailed(_) => ErrorKind::Authentication,
            Error::SubmissionRejected(_) => ErrorKind::Submission,
            Error::InvalidState { .. } => ErrorKind::State,
        }
    }

    /// The server reply that caused this error, if any.
    pub fn reply(&self) -> Option<&Response<String>> {
        match self {
            Error::GreetingRejected(reply)
            | Error::UnexpectedReply(reply)
            | Error::StartTlsRefused(reply)
            | Error::AuthenticationFailed(reply)
            | Error::SubmissionRejected(reply) => Some(reply),
            _ => None,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Connect(err) => Some(err),
            Error::Tls(err) => Some(err),
            Error::Base64(err) => Some(err),
            Error::Ntlm(err) => Some(err),
            _ => None,
        }
    }
}

struct DisplayReply<'x>(&'x Response<String>);

impl<'x> Display for DisplayReply<'x> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0.code(), self.0.message())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
            Error::Base64(e) => write!(f, "Base64 decode error: {}", e),
            Error::Ntlm(e) => write!(f, "NTLM error: {}", e),
            Error::Config(e) => write!(f, "Invalid configuration: {}", e),
            Error::Connect(e) => write!(f, "Connection failed: {}", e),
            Error::UnparseableReply => write!(f, "Unparseable SMTP reply"),
            Error::GreetingRejected(e) => write!(f, "Greeting rejected: {}", DisplayReply(e)),
            Error::UnexpectedReply(e) => write!(f, "Unexpected reply: {}", DisplayReply(e)),
            Error::StartTlsRefused(e) => {
                write!(f, "Encryption upgrade refused: {}", DisplayReply(e))
            }
            Error::UnexpectedChallenge => write!(f, "Unexpected authentication challenge"),
            Error::AuthenticationFailed(e) => {
                write!(f, "Authentication failed: {}", DisplayReply(e))
            }
            Error::SubmissionRejected(e) => write!(f, "Submission rejected: {}", DisplayReply(e)),
            Error::InvalidTLSName => write!(f, "Invalid TLS name provided"),
            Error::MissingCredentials => write!(f, "Missing authentication credentials"),
            Error::MissingMailFrom => write!(f, "Missing message sender"),
            Error::MissingRcptTo => write!(f, "Missing message recipients"),
            Error::InvalidState { expected, found } => {
                write!(f, "Session is {}, expected {}", found, expected)
            }
            Error::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Config => "configuration error",
            ErrorKind::Connection => "connection error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::AuthSetup => "authentication setup error",
            ErrorKind::AuthProtocol => "authentication protocol error",
            ErrorKind::Authentication => "authentication error",
            ErrorKind::Submission => "submission error",
            ErrorKind::State => "session state error",
            ErrorKind::Attachment => "attachment error",
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Base64(err)
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(Box::new(err))
    }
}

impl From<ntlm::Error> for Error {
    fn from(err: ntlm::Error) -> Self {
        Error::Ntlm(err)
    }
}
