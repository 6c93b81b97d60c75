// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Structural and signature validation for signed records. These checks are
//! independent of chain state; the journal layers chain-dependent checks
//! (duplicates, dependencies, on-chain rules) on top.

use crate::{
    address::validate_prefix, Batch, Block, ProtocolError, Transaction,
};
use sawtooth_crypto::sha512_hex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid signature on {kind} {id}")]
    InvalidSignature { kind: &'static str, id: String },
    #[error("transaction {id}: payload hash mismatch")]
    PayloadHashMismatch { id: String },
    #[error("transaction {id}: bad declared address {address:?}")]
    BadDeclaredAddress { id: String, address: String },
    #[error("transaction {id}: batcher key does not match batch signer")]
    BatcherMismatch { id: String },
    #[error("batch {id}: transaction list does not match header ids")]
    BatchManifestMismatch { id: String },
    #[error("block {id}: batch list does not match header ids")]
    BlockManifestMismatch { id: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Full structural check of one transaction, in the context of the batch
/// signer that encloses it.
pub fn validate_transaction(
    txn: &Transaction,
    batch_signer: &str,
) -> Result<(), ValidationError> {
    if !txn.verify_signature()? {
        return Err(ValidationError::InvalidSignature {
            kind: "transaction",
            id: txn.id().to_string(),
        });
    }
    let header = txn.header()?;
    if header.batcher_public_key != batch_signer {
        return Err(ValidationError::BatcherMismatch {
            id: txn.id().to_string(),
        });
    }
    if header.payload_sha512 != sha512_hex(&txn.payload) {
        return Err(ValidationError::PayloadHashMismatch {
            id: txn.id().to_string(),
        });
    }
    for declared in header.inputs.iter().chain(header.outputs.iter()) {
        if validate_prefix(declared).is_err() {
            return Err(ValidationError::BadDeclaredAddress {
                id: txn.id().to_string(),
                address: declared.clone(),
            });
        }
    }
    Ok(())
}

/// Full structural check of a batch and all contained transactions.
pub fn validate_batch(batch: &Batch) -> Result<(), ValidationError> {
    if !batch.verify_signature()? {
        return Err(ValidationError::InvalidSignature {
            kind: "batch",
            id: batch.id().to_string(),
        });
    }
    let header = batch.header()?;
    if header.transaction_ids.len() != batch.transactions.len()
        || header
            .transaction_ids
            .iter()
            .zip(batch.transactions.iter())
            .any(|(id, txn)| id != txn.id())
    {
        return Err(ValidationError::BatchManifestMismatch {
            id: batch.id().to_string(),
        });
    }
    for txn in &batch.transactions {
        validate_transaction(txn, &header.signer_public_key)?;
    }
    Ok(())
}

/// Structural check of a block: signature plus pointwise batch-id agreement.
/// Contained batches are checked individually as well.
pub fn validate_block(block: &Block) -> Result<(), ValidationError> {
    if !block.verify_signature()? {
        return Err(ValidationError::InvalidSignature {
            kind: "block",
            id: block.id().to_string(),
        });
    }
    let header = block.header()?;
    if header.batch_ids.len() != block.batches.len()
        || header
            .batch_ids
            .iter()
            .zip(block.batches.iter())
            .any(|(id, batch)| id != batch.id())
    {
        return Err(ValidationError::BlockManifestMismatch {
            id: block.id().to_string(),
        });
    }
    for batch in &block.batches {
        validate_batch(batch)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BatchBuilder, BlockBuilder, TransactionBuilder, NULL_BLOCK_IDENTIFIER};
    use claims::{assert_err, assert_ok};
    use sawtooth_crypto::PrivateKey;

    fn signed_batch(signer: &PrivateKey) -> Batch {
        let txn = TransactionBuilder::new("intkey", "1.0")
            .inputs(vec!["1cf126".into()])
            .outputs(vec!["1cf126".into()])
            .payload(b"inc k 1".to_vec())
            .build(signer, &signer.public_key())
            .unwrap();
        BatchBuilder::new(vec![txn]).build(signer).unwrap()
    }

    #[test]
    fn valid_batch_passes() {
        let signer = PrivateKey::generate();
        assert_ok!(validate_batch(&signed_batch(&signer)));
    }

    #[test]
    fn batcher_key_must_match_batch_signer() {
        let signer = PrivateKey::generate();
        let other = PrivateKey::generate();
        let txn = TransactionBuilder::new("intkey", "1.0")
            .payload(b"x".to_vec())
            .build(&signer, &other.public_key())
            .unwrap();
        let batch = BatchBuilder::new(vec![txn]).build(&signer).unwrap();
        assert_err!(validate_batch(&batch));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = PrivateKey::generate();
        let mut batch = signed_batch(&signer);
        batch.transactions[0].payload = b"inc k 2".to_vec();
        assert_err!(validate_batch(&batch));
    }

    #[test]
    fn reordered_transactions_break_the_manifest() {
        let signer = PrivateKey::generate();
        let txns: Vec<_> = (0..2)
            .map(|i| {
                TransactionBuilder::new("intkey", "1.0")
                    .payload(vec![i])
                    .build(&signer, &signer.public_key())
                    .unwrap()
            })
            .collect();
        let mut batch = BatchBuilder::new(txns).build(&signer).unwrap();
        batch.transactions.swap(0, 1);
        assert_err!(validate_batch(&batch));
    }

    #[test]
    fn block_manifest_checked_pointwise() {
        let signer = PrivateKey::generate();
        let batch = signed_batch(&signer);
        let mut block = BlockBuilder::new(0, NULL_BLOCK_IDENTIFIER)
            .state_root_hash("00".repeat(32))
            .batches(vec![batch])
            .build(&signer)
            .unwrap();
        assert_ok!(validate_block(&block));

        block.batches.push(signed_batch(&signer));
        assert_err!(validate_block(&block));
    }
}
