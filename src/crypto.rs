/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs, io, path::Path};

use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::protobuf::chromeos_update_engine::Signatures;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Payload contains no signatures")]
    NoSignatures,
    #[error("Failed to load public key")]
    LoadPublicKey(#[source] rsa::pkcs8::spki::Error),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Read a PEM-encoded PKCS8 public key from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let data = fs::read_to_string(path)?;

    RsaPublicKey::from_public_key_pem(&data).map_err(Error::LoadPublicKey)
}

/// Verify `digest` against the signatures in a [`Signatures`] message using
/// `public_key`. Each candidate signature carries the RSA PKCS#1 v1.5
/// encryption of the digest the payload generator signed; any candidate
/// matching `digest` verifies the payload.
pub fn verify_digest(
    digest: &[u8],
    signatures: &Signatures,
    public_key: &RsaPublicKey,
) -> Result<()> {
    let mut last_error = None;

    for signature in &signatures.signatures {
        let Some(data) = &signature.data else {
            continue;
        };

        let scheme = Pkcs1v15Sign::new::<Sha256>();
        match public_key.verify(scheme, digest, data) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.map_or(Error::NoSignatures, Error::Rsa))
}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;
    use sha2::Digest;

    use super::*;
    use crate::protobuf::chromeos_update_engine::mod_Signatures::Signature;

    #[test]
    fn verify_digest_accepts_valid_signature_and_rejects_others() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = private_key.to_public_key();

        let digest = Sha256::digest(b"payload bytes before the signature blob");
        let signed = private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest.as_slice())
            .unwrap();

        let signatures = Signatures {
            signatures: vec![
                // An entry without data must be skipped, not fail the scan.
                Signature {
                    version: Some(1),
                    data: None,
                },
                Signature {
                    version: Some(1),
                    data: Some(signed),
                },
            ],
        };

        verify_digest(digest.as_slice(), &signatures, &public_key).unwrap();

        let wrong_digest = Sha256::digest(b"some other bytes");
        assert!(matches!(
            verify_digest(wrong_digest.as_slice(), &signatures, &public_key),
            Err(Error::Rsa(_)),
        ));

        let empty = Signatures { signatures: vec![] };
        assert!(matches!(
            verify_digest(digest.as_slice(), &empty, &public_key),
            Err(Error::NoSignatures),
        ));
    }
}
