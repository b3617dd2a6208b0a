// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Key descriptors and the order-preserving key codec.

pub mod codec;
pub mod descriptor;

pub use codec::{build_key, compare_keys, is_null_value, pad_key};
pub use descriptor::{KeyDescriptor, KeyPart, PartType, StoredKey};
