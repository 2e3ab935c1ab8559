// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! TLS acceptor construction and the in-place transport upgrade.
//!
//! The crypto provider is pinned to `ring` rather than relying on a process-wide default, so the
//! library works no matter which providers the final binary happens to link.

use std::{path::Path, sync::Arc, time::Duration};

use rustls::{
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::error::TlsError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Parse every certificate in a PEM bundle.
fn certificates(pem: &[u8], source: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certificates = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;

    if certificates.is_empty() {
        return Err(TlsError::NoCertificates(source.to_string()));
    }

    Ok(certificates)
}

/// Parse the first private key in a PEM file.
fn private_key(pem: &[u8], source: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(TlsError::Pem)?
        .ok_or_else(|| TlsError::NoPrivateKey(source.to_string()))
}

/// Build an acceptor from PEM text.
///
/// Client certificates are never required. With `client_ca_pem`, any certificate a client does
/// present must chain to one of those CAs.
///
/// # Errors
///
/// A [`TlsError`] if the PEM data holds no usable certificate or key, or rustls rejects them.
pub fn acceptor_from_pem(
    certificate_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: Option<&[u8]>,
) -> Result<TlsAcceptor, TlsError> {
    let chain = certificates(certificate_pem, "certificate")?;
    let key = private_key(key_pem, "private key")?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    let builder = match client_ca_pem {
        Some(pem) => {
            let mut roots = RootCertStore::empty();
            for certificate in certificates(pem, "client CA bundle")? {
                roots.add(certificate)?;
            }

            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
                .allow_unauthenticated()
                .build()?;

            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder.with_single_cert(chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build an acceptor from PEM files. See [`acceptor_from_pem`].
///
/// # Errors
///
/// [`TlsError::Read`] if a file cannot be read, otherwise see [`acceptor_from_pem`].
pub fn acceptor_from_files(
    certificate: &Path,
    key: &Path,
    client_ca: Option<&Path>,
) -> Result<TlsAcceptor, TlsError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
    };

    let client_ca = client_ca.map(&read).transpose()?;

    let acceptor = acceptor_from_pem(&read(certificate)?, &read(key)?, client_ca.as_deref())?;

    tracing::info!(
        certificate = %certificate.display(),
        client_auth = client_ca.is_some(),
        "TLS certificate loaded"
    );

    Ok(acceptor)
}

/// Run the server side of a TLS handshake over `stream`.
///
/// Any plaintext the caller buffered before this point must already be discarded, since none of
/// it may be interpreted as post-handshake input.
///
/// # Errors
///
/// On a failed handshake, the [`TlsError`] together with the original stream, so the caller can
/// decide what happens to the connection next. If the handshake timed out the stream was
/// consumed by the unfinished handshake and `None` is returned in its place.
pub async fn upgrade<S>(
    stream: S,
    acceptor: &TlsAcceptor,
    timeout: Duration,
) -> Result<TlsStream<S>, (TlsError, Option<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, acceptor.accept(stream).into_fallible()).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err((err, stream))) => Err((TlsError::Handshake(err), Some(stream))),
        Err(_elapsed) => Err((TlsError::HandshakeTimedOut, None)),
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::test::{tls_client, SelfSigned};

    type Result = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_acceptor_from_pem() -> Result {
        let identity = SelfSigned::new()?;

        acceptor_from_pem(identity.certificate_pem(), identity.key_pem(), None)?;
        acceptor_from_pem(
            identity.certificate_pem(),
            identity.key_pem(),
            Some(identity.certificate_pem()),
        )?;

        Ok(())
    }

    #[test]
    fn test_acceptor_rejects_missing_material() -> Result {
        let identity = SelfSigned::new()?;

        assert!(matches!(
            acceptor_from_pem(b"", identity.key_pem(), None),
            Err(TlsError::NoCertificates(_))
        ));
        assert!(matches!(
            acceptor_from_pem(identity.certificate_pem(), b"", None),
            Err(TlsError::NoPrivateKey(_))
        ));

        Ok(())
    }

    #[test]
    fn test_acceptor_from_files() -> Result {
        let identity = SelfSigned::new()?;
        let (certificate, key) = identity.write_to_temp_files()?;

        acceptor_from_files(certificate.path(), key.path(), None)?;

        assert!(matches!(
            acceptor_from_files(Path::new("/nonexistent/cert.pem"), key.path(), None),
            Err(TlsError::Read { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_upgrade_handshake() -> Result {
        let identity = SelfSigned::new()?;
        let acceptor = identity.acceptor()?;
        let (client, server) = tokio::io::duplex(16 * 1024);

        let client = tokio::spawn(async move {
            let mut stream = tls_client(client, identity.certificate_der()).await?;
            stream.write_all(b"NOOP\r\n").await?;
            stream.flush().await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(stream)
        });

        let mut server = upgrade(server, &acceptor, crate::timeouts::EXPECTED)
            .await
            .map_err(|(err, _)| err)?;

        let mut line = [0; 6];
        server.read_exact(&mut line).await?;
        assert_eq!(&line, b"NOOP\r\n");

        client.await?.map_err(|err| err.to_string())?;

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_handshake_returns_stream() -> Result {
        let identity = SelfSigned::new()?;
        let acceptor = identity.acceptor()?;
        let (mut client, server) = tokio::io::duplex(1024);

        // Plaintext where a ClientHello should be.
        client.write_all(b"QUIT\r\n\r\n").await?;

        let Err((err, stream)) = upgrade(server, &acceptor, crate::timeouts::EXPECTED).await else {
            panic!("handshake with plaintext input succeeded");
        };

        assert!(matches!(err, TlsError::Handshake(_)), "{err}");
        assert!(stream.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_silent_client_times_out() -> Result {
        let identity = SelfSigned::new()?;
        let acceptor = identity.acceptor()?;
        let (_client, server) = tokio::io::duplex(1024);

        let Err((err, stream)) = upgrade(server, &acceptor, Duration::from_millis(50)).await else {
            panic!("handshake without a client succeeded");
        };

        assert!(matches!(err, TlsError::HandshakeTimedOut));
        assert!(stream.is_none());

        Ok(())
    }
}
