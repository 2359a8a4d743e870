/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{convert::TryFrom, io, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    ClientConfig, RootCertStore, SignatureScheme,
};
use rustls_pki_types::{ServerName, TrustAnchor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{Error, SmtpClient};

use super::{AssertReply, SessionState};

/// Wraps a plaintext stream in an encrypted one after STARTTLS was accepted.
#[allow(async_fn_in_trait)]
pub trait TlsUpgrade<T> {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    async fn upgrade(&self, stream: T, hostname: &str) -> crate::Result<Self::Stream>;
}

impl<T: AsyncRead + AsyncWrite + Unpin> TlsUpgrade<T> for TlsConnector {
    type Stream = TlsStream<T>;

    async fn upgrade(&self, stream: T, hostname: &str) -> crate::Result<TlsStream<T>> {
        self.connect(
            ServerName::try_from(hostname)
                .map_err(|_| crate::Error::InvalidTLSName)?
                .to_owned(),
            stream,
        )
        .await
        .map_err(|err| {
            let kind = err.kind();
            if let Some(inner) = err.into_inner() {
                match inner.downcast::<rustls::Error>() {
                    Ok(error) => Error::Tls(error),
                    Err(error) => Error::Io(io::Error::new(kind, error)),
                }
            } else {
                Error::Io(io::Error::new(kind, "Unspecified"))
            }
        })
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> SmtpClient<T> {
    /// Asks the server to start TLS. The handshake itself happens in
    /// [`SmtpClient::into_tls`].
    pub async fn start_tls(&mut self) -> crate::Result<()> {
        self.require(SessionState::Greeted, "greeted")?;
        if !self.start_tls_offered() {
            log::warn!("Server did not advertise STARTTLS, attempting it anyway");
        }

        let result = self
            .cmd(b"STARTTLS\r\n")
            .await
            .and_then(|reply| reply.assert_positive_completion(Error::StartTlsRefused));
        self.track(result)?;
        self.tls_accepted = true;
        Ok(())
    }

    /// Performs the TLS handshake. Capabilities announced before the upgrade
    /// are discarded, EHLO must be sent again.
    pub async fn into_tls<U: TlsUpgrade<T>>(
        self,
        upgrader: &U,
        hostname: &str,
    ) -> crate::Result<SmtpClient<U::Stream>> {
        if !self.tls_accepted {
            return Err(crate::Error::InvalidState {
                expected: "STARTTLS accepted",
                found: self.state,
            });
        }

        let stream = tokio::time::timeout(self.timeout, upgrader.upgrade(self.stream, hostname))
            .await
            .map_err(|_| crate::Error::Timeout)??;
        log::info!("Encryption negotiated with {}", hostname);

        Ok(SmtpClient {
            stream,
            timeout: self.timeout,
            state: SessionState::EncryptionNegotiated,
            capabilities: None,
            framing: self.framing,
            tls_accepted: false,
        })
    }

    /// STARTTLS followed by the handshake.
    pub async fn upgrade_encryption<U: TlsUpgrade<T>>(
        mut self,
        upgrader: &U,
        hostname: &str,
    ) -> crate::Result<SmtpClient<U::Stream>> {
        self.start_tls().await?;
        self.into_tls(upgrader, hostname).await
    }
}

pub fn build_tls_connector(allow_invalid_certs: bool) -> TlsConnector {
    let config = if !allow_invalid_certs {
        let mut root_cert_store = RootCertStore::empty();

        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
            subject: ta.subject.clone(),
            subject_public_key_info: ta.subject_public_key_info.clone(),
            name_constraints: ta.name_constraints.clone(),
        }));

        ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth()
    } else {
        log::warn!("Certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DummyVerifier {}))
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

#[doc(hidden)]
#[derive(Debug)]
struct DummyVerifier;

impl ServerCertVerifier for DummyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod test {
    use crate::{
        smtp::{
            mock::{client, Passthrough, ScriptedStream},
            SessionState,
        },
        Error, ErrorKind,
    };

    #[tokio::test]
    async fn upgrade_resets_capabilities() {
        let stream = ScriptedStream::new([
            "250-mx.example.com\r\n250 STARTTLS\r\n",
            "220 2.0.0 Ready to start TLS\r\n",
        ]);
        let transcript = stream.transcript();
        let mut client = client(stream);
        client.state = SessionState::Greeted;
        client.ehlo("client.test").await.unwrap();

        client.start_tls().await.unwrap();
        assert_eq!(client.state(), &SessionState::Greeted);

        let client = client.into_tls(&Passthrough, "mx.example.com").await.unwrap();
        assert_eq!(client.state(), &SessionState::EncryptionNegotiated);
        assert!(client.capabilities().is_none());
        assert_eq!(transcript.lines(), vec!["EHLO client.test", "STARTTLS"]);
    }

    #[tokio::test]
    async fn refused_upgrade() {
        let stream = ScriptedStream::new([
            "250 mx.example.com\r\n",
            "454 4.7.0 TLS not available due to temporary reason\r\n",
        ]);
        let mut client = client(stream);
        client.state = SessionState::Greeted;
        client.ehlo("client.test").await.unwrap();

        let err = client.start_tls().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        match &err {
            Error::StartTlsRefused(reply) => assert_eq!(reply.code(), 454),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(client.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn handshake_requires_accepted_starttls() {
        let mut client = client(ScriptedStream::new([]));
        client.state = SessionState::Greeted;
        assert!(matches!(
            client.into_tls(&Passthrough, "mx.example.com").await,
            Err(Error::InvalidState { .. })
        ));
    }
}
