//! Threshold signing
//!
//! `MultisigSigner` is a k-of-n scheme over ed25519: a share is one member's
//! signature tagged with its peer index, and the full signature is the sorted
//! set of `threshold` valid shares. Any holder of the committee's public keys
//! can verify it.

use crate::error::SignerError;
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sc_state::hash_data;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Partial signing and recovery of a full signature
pub trait ThresholdSigner: Send + Sync {
    /// Sign `data` with this member's key share
    fn sign_share(&self, data: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Combine at least `threshold` shares over `data` into a full signature
    fn recover_full_signature(&self, shares: &[Vec<u8>], data: &[u8]) -> Result<Vec<u8>, SignerError>;

    fn verify_full_signature(&self, signature: &[u8], data: &[u8]) -> Result<(), SignerError>;
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
struct SigShare {
    index: u16,
    signature: [u8; 64],
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
struct FullSignature {
    shares: Vec<SigShare>,
}

/// ed25519 k-of-n signer of one committee member
#[derive(Clone)]
pub struct MultisigSigner {
    own: Option<(u16, SigningKey)>,
    public_keys: Arc<Vec<VerifyingKey>>,
    threshold: u16,
}

impl MultisigSigner {
    pub fn new(
        own_index: u16,
        signing_key: SigningKey,
        public_keys: Arc<Vec<VerifyingKey>>,
        threshold: u16,
    ) -> Result<Self, SignerError> {
        let mut signer = Self::verifier(public_keys, threshold)?;
        if own_index as usize >= signer.public_keys.len()
            || signer.public_keys[own_index as usize] != signing_key.verifying_key()
        {
            return Err(SignerError::Malformed(format!(
                "key share does not belong to peer #{}",
                own_index
            )));
        }
        signer.own = Some((own_index, signing_key));
        Ok(signer)
    }

    /// Signer holding no key share, only able to verify
    pub fn verifier(public_keys: Arc<Vec<VerifyingKey>>, threshold: u16) -> Result<Self, SignerError> {
        let size = public_keys.len() as u16;
        if threshold == 0 || threshold > size {
            return Err(SignerError::BadThreshold { threshold, size });
        }
        Ok(Self {
            own: None,
            public_keys,
            threshold,
        })
    }

    /// Deterministically derive the key shares of a whole committee
    pub fn generate_committee(seed: &[u8], size: u16, threshold: u16) -> Result<Vec<Self>, SignerError> {
        let keys: Vec<SigningKey> = (0..size)
            .map(|i| SigningKey::from_bytes(&hash_data(&[seed, &i.to_le_bytes()]).0))
            .collect();
        let public_keys = Arc::new(keys.iter().map(|k| k.verifying_key()).collect::<Vec<_>>());
        keys.into_iter()
            .enumerate()
            .map(|(i, key)| Self::new(i as u16, key, public_keys.clone(), threshold))
            .collect()
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn public_keys(&self) -> Arc<Vec<VerifyingKey>> {
        self.public_keys.clone()
    }

    fn verify_share(&self, share: &SigShare, data: &[u8]) -> bool {
        match self.public_keys.get(share.index as usize) {
            Some(pk) => pk.verify(data, &Signature::from_bytes(&share.signature)).is_ok(),
            None => false,
        }
    }
}

impl ThresholdSigner for MultisigSigner {
    fn sign_share(&self, data: &[u8]) -> Result<Vec<u8>, SignerError> {
        let (index, key) = self.own.as_ref().ok_or(SignerError::NoSigningKey)?;
        let share = SigShare {
            index: *index,
            signature: key.sign(data).to_bytes(),
        };
        Ok(borsh::to_vec(&share).expect("SigShare serialization should not fail"))
    }

    fn recover_full_signature(&self, shares: &[Vec<u8>], data: &[u8]) -> Result<Vec<u8>, SignerError> {
        let mut valid: BTreeMap<u16, SigShare> = BTreeMap::new();
        for raw in shares {
            let share: SigShare = match borsh::from_slice(raw) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping undecodable signature share");
                    continue;
                }
            };
            if !self.verify_share(&share, data) {
                tracing::debug!(peer = share.index, "Skipping invalid signature share");
                continue;
            }
            valid.entry(share.index).or_insert(share);
        }

        let need = self.threshold as usize;
        if valid.len() < need {
            return Err(SignerError::NotEnoughShares {
                have: valid.len(),
                need,
            });
        }
        let full = FullSignature {
            shares: valid.into_values().take(need).collect(),
        };
        Ok(borsh::to_vec(&full).expect("FullSignature serialization should not fail"))
    }

    fn verify_full_signature(&self, signature: &[u8], data: &[u8]) -> Result<(), SignerError> {
        let full: FullSignature =
            borsh::from_slice(signature).map_err(|e| SignerError::Malformed(e.to_string()))?;

        let mut prev: Option<u16> = None;
        for share in &full.shares {
            if prev.is_some_and(|p| p >= share.index) {
                return Err(SignerError::Malformed("shares not strictly ordered".into()));
            }
            if !self.verify_share(share, data) {
                return Err(SignerError::Malformed(format!(
                    "invalid share of peer #{}",
                    share.index
                )));
            }
            prev = Some(share.index);
        }
        if full.shares.len() < self.threshold as usize {
            return Err(SignerError::NotEnoughShares {
                have: full.shares.len(),
                need: self.threshold as usize,
            });
        }
        Ok(())
    }
}
