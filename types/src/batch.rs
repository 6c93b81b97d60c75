// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{ProtocolError, Transaction, TransactionId};
use sawtooth_crypto::{PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// The signed portion of a batch: the signer and the ids of the contained
/// transactions, in application order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub signer_public_key: String,
    pub transaction_ids: Vec<TransactionId>,
}

impl BatchHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bcs::to_bytes(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bcs::from_bytes(bytes)?)
    }
}

/// The atomic commit unit: all contained transactions apply in listed order,
/// or none do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(with = "serde_bytes")]
    pub header: Vec<u8>,
    pub header_signature: String,
    pub transactions: Vec<Transaction>,
}

impl Batch {
    pub fn header(&self) -> Result<BatchHeader, ProtocolError> {
        BatchHeader::from_bytes(&self.header)
    }

    /// Batch identity: the header signature.
    pub fn id(&self) -> &str {
        &self.header_signature
    }

    pub fn transaction_ids(&self) -> impl Iterator<Item = &str> {
        self.transactions.iter().map(|txn| txn.id())
    }

    pub fn verify_signature(&self) -> Result<bool, ProtocolError> {
        let header = self.header()?;
        let public_key = PublicKey::from_hex(&header.signer_public_key)
            .map_err(|e| ProtocolError::Identity(e.to_string()))?;
        let signature = Signature::from_hex(&self.header_signature)
            .map_err(|e| ProtocolError::Identity(e.to_string()))?;
        Ok(public_key.verify(&self.header, &signature))
    }
}

/// Builds and signs batches over already-signed transactions.
pub struct BatchBuilder {
    transactions: Vec<Transaction>,
}

impl BatchBuilder {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    pub fn build(self, signer: &PrivateKey) -> Result<Batch, ProtocolError> {
        let header = BatchHeader {
            signer_public_key: signer.public_key().as_hex(),
            transaction_ids: self
                .transactions
                .iter()
                .map(|txn| txn.header_signature.clone())
                .collect(),
        };
        let header_bytes = header.to_bytes()?;
        let signature = signer.sign(&header_bytes);
        Ok(Batch {
            header: header_bytes,
            header_signature: signature.as_hex(),
            transactions: self.transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionBuilder;
    use claims::assert_ok;

    #[test]
    fn built_batch_verifies_and_lists_txns_in_order() {
        let signer = PrivateKey::generate();
        let txns: Vec<_> = (0..3)
            .map(|i| {
                TransactionBuilder::new("intkey", "1.0")
                    .payload(vec![i])
                    .build(&signer, &signer.public_key())
                    .unwrap()
            })
            .collect();
        let ids: Vec<String> = txns.iter().map(|t| t.header_signature.clone()).collect();

        let batch = assert_ok!(BatchBuilder::new(txns).build(&signer));
        assert!(assert_ok!(batch.verify_signature()));
        let header = assert_ok!(batch.header());
        assert_eq!(header.transaction_ids, ids);
        assert_eq!(
            batch.transaction_ids().collect::<Vec<_>>(),
            ids.iter().map(String::as_str).collect::<Vec<_>>()
        );
    }
}
