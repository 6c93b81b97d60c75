// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{ProtocolError, TransactionId};
use sawtooth_crypto::{sha512_hex, PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// The signed portion of a transaction.
///
/// `inputs` and `outputs` are even-length hex address prefixes declaring the
/// state this transaction may read and write. `dependencies` are transaction
/// ids that must be committed (or scheduled earlier) before this one may
/// execute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub family_name: String,
    pub family_version: String,
    pub signer_public_key: String,
    pub batcher_public_key: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub dependencies: Vec<TransactionId>,
    pub payload_sha512: String,
    pub nonce: String,
}

impl TransactionHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bcs::to_bytes(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bcs::from_bytes(bytes)?)
    }
}

/// A signed transaction. The header is retained as the exact bytes the
/// signature covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(with = "serde_bytes")]
    pub header: Vec<u8>,
    pub header_signature: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn header(&self) -> Result<TransactionHeader, ProtocolError> {
        TransactionHeader::from_bytes(&self.header)
    }

    /// Transaction identity: the header signature.
    pub fn id(&self) -> &str {
        &self.header_signature
    }

    /// Verifies the header signature over the stored header bytes.
    pub fn verify_signature(&self) -> Result<bool, ProtocolError> {
        let header = self.header()?;
        let public_key = PublicKey::from_hex(&header.signer_public_key)
            .map_err(|e| ProtocolError::Identity(e.to_string()))?;
        let signature = Signature::from_hex(&self.header_signature)
            .map_err(|e| ProtocolError::Identity(e.to_string()))?;
        Ok(public_key.verify(&self.header, &signature))
    }
}

/// Builds and signs transactions; used by the genesis tooling and tests.
#[derive(Default)]
pub struct TransactionBuilder {
    family_name: String,
    family_version: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    dependencies: Vec<TransactionId>,
    payload: Vec<u8>,
    nonce: Option<String>,
}

impl TransactionBuilder {
    pub fn new(family_name: impl Into<String>, family_version: impl Into<String>) -> Self {
        Self {
            family_name: family_name.into(),
            family_version: family_version.into(),
            ..Default::default()
        }
    }

    pub fn inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn dependencies(mut self, dependencies: Vec<TransactionId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Signs the header with `signer`. `batcher` is the public key of the
    /// batch signer that will enclose this transaction.
    pub fn build(
        self,
        signer: &PrivateKey,
        batcher: &PublicKey,
    ) -> Result<Transaction, ProtocolError> {
        let nonce = self
            .nonce
            .unwrap_or_else(|| sha512_hex(&rand_nonce())[..32].to_string());
        let header = TransactionHeader {
            family_name: self.family_name,
            family_version: self.family_version,
            signer_public_key: signer.public_key().as_hex(),
            batcher_public_key: batcher.as_hex(),
            inputs: self.inputs,
            outputs: self.outputs,
            dependencies: self.dependencies,
            payload_sha512: sha512_hex(&self.payload),
            nonce,
        };
        let header_bytes = header.to_bytes()?;
        let signature = signer.sign(&header_bytes);
        Ok(Transaction {
            header: header_bytes,
            header_signature: signature.as_hex(),
            payload: self.payload,
        })
    }
}

fn rand_nonce() -> Vec<u8> {
    // Nonce uniqueness only needs to hold per signer; epoch nanos suffice.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos().to_le_bytes().to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;

    fn make_txn() -> Transaction {
        let signer = PrivateKey::generate();
        let batcher = PrivateKey::generate();
        TransactionBuilder::new("intkey", "1.0")
            .inputs(vec!["1cf126".into()])
            .outputs(vec!["1cf126".into()])
            .payload(b"set k 10".to_vec())
            .build(&signer, &batcher.public_key())
            .unwrap()
    }

    #[test]
    fn built_transaction_verifies() {
        let txn = make_txn();
        assert!(assert_ok!(txn.verify_signature()));
        let header = assert_ok!(txn.header());
        assert_eq!(header.family_name, "intkey");
        assert_eq!(header.payload_sha512, sha512_hex(b"set k 10"));
    }

    #[test]
    fn tampered_header_fails_verification() {
        let mut txn = make_txn();
        // Flip one bit in the serialized header.
        txn.header[10] ^= 0x01;
        match txn.verify_signature() {
            Ok(ok) => assert!(!ok),
            // A flipped byte may also break header parsing; both outcomes
            // reject the transaction.
            Err(_) => {}
        }
    }

    #[test]
    fn header_bytes_round_trip_bitwise() {
        let txn = make_txn();
        let header = txn.header().unwrap();
        assert_eq!(header.to_bytes().unwrap(), txn.header);
    }
}
