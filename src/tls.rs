//! TLS configuration and types
//!
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fmt;
use std::io::{BufRead, BufReader, Cursor};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

/// Represents an extra root X509 certificate trusted on the server-facing leg.
#[derive(Clone, Debug)]
pub struct Certificate {
  original: Cert,
}
#[derive(Clone, Debug)]
enum Cert {
  Der(Vec<u8>),
  Pem(Vec<u8>),
}
impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      original: Cert::Der(der.to_owned()),
    })
  }

  /// Create a `Certificate` from a PEM encoded certificate
  pub fn from_pem(pem: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      original: Cert::Pem(pem.to_owned()),
    })
  }

  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> crate::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem_bundle);

    read_pem_certs(&mut reader)?
      .iter()
      .map(|cert_vec| Certificate::from_der(cert_vec))
      .collect::<crate::Result<Vec<Certificate>>>()
  }

  pub(crate) fn add_to_tls(self, root_cert_store: &mut RootCertStore) -> crate::Result<()> {
    match self.original {
      Cert::Der(buf) => root_cert_store
        .add(buf.into())
        .map_err(crate::errors::builder)?,
      Cert::Pem(buf) => {
        let mut reader = Cursor::new(buf);
        let certs = read_pem_certs(&mut reader)?;
        for c in certs {
          root_cert_store
            .add(c.into())
            .map_err(crate::errors::builder)?;
        }
      }
    }
    Ok(())
  }
}

fn read_pem_certs(reader: &mut impl BufRead) -> crate::Result<Vec<Vec<u8>>> {
  rustls_pemfile::certs(reader)
    .map(|result| match result {
      Ok(cert) => Ok(cert.as_ref().to_vec()),
      Err(_) => Err(crate::errors::builder("invalid certificate encoding")),
    })
    .collect()
}

/// The certificate chain and private key presented to the game client when a
/// WebSocket session is upgraded on the client-facing leg.
pub struct Identity {
  key: PrivateKeyDer<'static>,
  certs: Vec<CertificateDer<'static>>,
}

impl Clone for Identity {
  fn clone(&self) -> Self {
    Identity {
      key: self.key.clone_key(),
      certs: self.certs.clone(),
    }
  }
}

impl fmt::Debug for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Identity")
      .field("certs", &self.certs.len())
      .finish_non_exhaustive()
  }
}

impl Identity {
  /// Parses PEM encoded private key and certificate.
  ///
  /// The input should contain a PEM encoded private key
  /// and at least one PEM encoded certificate.
  ///
  /// Note: The private key must be in RSA, SEC1 Elliptic Curve or PKCS#8 format.
  ///
  /// # Examples
  ///
  /// ```
  /// # use std::fs::File;
  /// # use std::io::Read;
  /// # fn pem() -> Result<(), Box<dyn std::error::Error>> {
  /// let mut buf = Vec::new();
  /// File::open("relay-identity.pem")?
  ///     .read_to_end(&mut buf)?;
  /// let id = slinger_relay::tls::Identity::from_pem(&buf)?;
  /// # drop(id);
  /// # Ok(())
  /// # }
  /// ```
  pub fn from_pem(buf: &[u8]) -> crate::Result<Identity> {
    use rustls_pemfile::Item;

    let mut pem = Cursor::new(buf);
    let mut sk = Vec::<PrivateKeyDer>::new();
    let mut certs = Vec::<CertificateDer>::new();

    for result in rustls_pemfile::read_all(&mut pem) {
      match result {
        Ok(Item::X509Certificate(cert)) => certs.push(cert),
        Ok(Item::Pkcs1Key(key)) => sk.push(key.into()),
        Ok(Item::Pkcs8Key(key)) => sk.push(key.into()),
        Ok(Item::Sec1Key(key)) => sk.push(key.into()),
        Ok(_) => {
          return Err(crate::errors::builder(TLSError::General(String::from(
            "No valid certificate was found",
          ))))
        }
        Err(_) => {
          return Err(crate::errors::builder(TLSError::General(String::from(
            "Invalid identity PEM file",
          ))))
        }
      }
    }

    if let (Some(key), false) = (sk.pop(), certs.is_empty()) {
      Ok(Identity { key, certs })
    } else {
      Err(crate::errors::builder(TLSError::General(String::from(
        "private key or certificate not found",
      ))))
    }
  }

  /// Build the server side TLS configuration for this identity.
  pub(crate) fn server_config(&self) -> crate::Result<rustls::ServerConfig> {
    rustls::ServerConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()
      .map_err(|_| crate::errors::builder("invalid TLS versions"))?
      .with_no_client_auth()
      .with_single_cert(self.certs.clone(), self.key.clone_key())
      .map_err(crate::errors::builder)
  }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Build the client side TLS configuration used toward the real server.
pub(crate) fn client_config(
  certs_verification: bool,
  certificates: &[Certificate],
) -> crate::Result<rustls::ClientConfig> {
  let config_builder = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|_| crate::errors::builder("invalid TLS versions"))?;
  let config = if certs_verification {
    let mut root_cert_store = RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in certificates.iter().cloned() {
      cert.add_to_tls(&mut root_cert_store)?;
    }
    config_builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  } else {
    config_builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  Ok(config)
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
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
