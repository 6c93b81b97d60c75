// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::StoreError;

/// How a key type is encoded for a particular schema. Encodings must be
/// order-preserving where the schema relies on iteration order (e.g.
/// big-endian integers).
pub trait KeyCodec<S: Schema + ?Sized>: Sized {
    fn encode_key(&self) -> Result<Vec<u8>, StoreError>;
    fn decode_key(data: &[u8]) -> Result<Self, StoreError>;
}

/// How a value type is encoded for a particular schema.
pub trait ValueCodec<S: Schema + ?Sized>: Sized {
    fn encode_value(&self) -> Result<Vec<u8>, StoreError>;
    fn decode_value(data: &[u8]) -> Result<Self, StoreError>;
}

/// A logical table: a column family plus key/value codecs.
pub trait Schema: Sized + 'static {
    const COLUMN_FAMILY_NAME: &'static str;
    type Key: KeyCodec<Self>;
    type Value: ValueCodec<Self>;
}

/// Declares a schema type and wires it to a column family.
///
/// ```ignore
/// define_schema!(BlockSchema, BlockId, Block, "block");
/// ```
#[macro_export]
macro_rules! define_schema {
    ($schema_type:ident, $key_type:ty, $value_type:ty, $cf_name:expr) => {
        #[derive(Debug)]
        pub struct $schema_type;

        impl $crate::schema::Schema for $schema_type {
            const COLUMN_FAMILY_NAME: &'static str = $cf_name;
            type Key = $key_type;
            type Value = $value_type;
        }
    };
}
