//! Lock claims, validator attestations and aggregated threshold proofs

use crate::error::BridgeError;
use crate::model::{Amount, ChainId};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Signature, H256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;
use uuid::Uuid;

const CLAIM_DOMAIN: &[u8] = b"conduit/lock-claim/v1";

/// The statement validators sign: this much value is locked on the source
/// ledger for this bridge id and may be minted to this recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockClaim {
    pub bridge_id: Uuid,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub lock_ref: String,
    pub owner: String,
    pub recipient: String,
    pub amount: Amount,
}

impl LockClaim {
    /// Domain-separated keccak digest of every field.
    pub fn digest(&self) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(CLAIM_DOMAIN);
        hasher.update(self.bridge_id.as_bytes());
        for part in [
            self.source_chain.as_str(),
            self.target_chain.as_str(),
            &self.lock_ref,
            &self.owner,
            &self.recipient,
        ] {
            hasher.update((part.len() as u32).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(self.amount.to_be_bytes());
        H256::from_slice(&hasher.finalize())
    }
}

/// One validator's signed statement about a bridge id. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorAttestation {
    pub validator_id: Address,
    pub bridge_id: Uuid,
    pub digest: H256,
    pub signature: Signature,
    pub timestamp: DateTime<Utc>,
}

impl ValidatorAttestation {
    /// True when the signature recovers to the claimed validator.
    pub fn signature_valid(&self) -> bool {
        matches!(self.signature.recover(self.digest), Ok(signer) if signer == self.validator_id)
    }
}

/// Aggregated m-of-n proof handed to the target ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdProof {
    pub bridge_id: Uuid,
    pub claim: LockClaim,
    pub digest: H256,
    pub threshold: usize,
    pub attestations: Vec<ValidatorAttestation>,
}

impl ThresholdProof {
    /// Checks the proof against the registered validator set and returns the
    /// number of distinct valid signers.
    pub fn verify(&self, validators: &BTreeSet<Address>) -> Result<usize, BridgeError> {
        let reject = |reason: String| BridgeError::ProofRejected {
            bridge_id: self.bridge_id,
            reason,
        };

        if self.claim.bridge_id != self.bridge_id {
            return Err(reject("claim is for another bridge id".to_string()));
        }
        if self.claim.digest() != self.digest {
            return Err(reject("digest does not match the claim".to_string()));
        }

        let mut signers = BTreeSet::new();
        for attestation in &self.attestations {
            if attestation.bridge_id != self.bridge_id || attestation.digest != self.digest {
                return Err(reject(format!(
                    "attestation from {:?} covers a different statement",
                    attestation.validator_id
                )));
            }
            if !validators.contains(&attestation.validator_id) {
                return Err(reject(format!(
                    "{:?} is not a registered validator",
                    attestation.validator_id
                )));
            }
            if !attestation.signature_valid() {
                return Err(reject(format!(
                    "signature from {:?} does not recover",
                    attestation.validator_id
                )));
            }
            signers.insert(attestation.validator_id);
        }

        if self.threshold == 0 || signers.len() < self.threshold {
            return Err(reject(format!(
                "{} distinct signers, {} required",
                signers.len(),
                self.threshold
            )));
        }
        Ok(signers.len())
    }
}
