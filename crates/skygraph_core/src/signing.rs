/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use ed25519_dalek::{Signer, SigningKey as DalekKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use skygraph_protocol::Label;

/// Holds the labeler's private key and signs label payloads: the
/// signature covers the SHA-256 of the label's CBOR encoding with `sig`
/// unset.
#[derive(Clone)]
pub struct SigningKey {
    key: DalekKey,
}

impl SigningKey {
    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim()).context("decode signing key hex")?;
        let seed: [u8; 32] = match bytes.try_into() {
            Ok(seed) => seed,
            Err(bytes) => bail!("signing key must be 32 bytes, got {}", bytes.len()),
        };
        Ok(SigningKey {
            key: DalekKey::from_bytes(&seed),
        })
    }

    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        SigningKey {
            key: DalekKey::from_bytes(&seed),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn hash_and_sign(&self, data: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(data);
        self.key.sign(digest.as_slice()).to_vec()
    }

    /// Zero any existing signature, serialize, sign, write the signature
    /// back.
    pub fn sign_label(&self, label: &mut Label) -> Result<()> {
        label.sig = None;
        let unsigned = label.to_cbor()?;
        label.sig = Some(self.hash_and_sign(&unsigned));
        Ok(())
    }

    pub fn sign_label_and_encode(&self, label: &mut Label) -> Result<Vec<u8>> {
        self.sign_label(label)?;
        label.to_cbor()
    }

    pub fn verify_label(&self, label: &Label) -> Result<()> {
        let Some(sig_bytes) = label.sig.clone() else {
            bail!("label has no signature");
        };
        let mut unsigned = label.clone();
        unsigned.sig = None;
        let digest = Sha256::digest(unsigned.to_cbor()?);
        let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
            Ok(sig) => sig,
            Err(bytes) => bail!("signature must be 64 bytes, got {}", bytes.len()),
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        let verifying: VerifyingKey = self.key.verifying_key();
        verifying
            .verify(digest.as_slice(), &sig)
            .context("label signature invalid")
    }
}
