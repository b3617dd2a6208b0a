// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    format::{read_ptr, write_ptr, NodeNo, MAX_KEY_LEN, MAX_KEY_PARTS},
    Error, Result,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const DESCENDING_BIT: u8 = 0x80;

const FLAG_DUPLICATES: u8 = 0x01;
const FLAG_COMPRESS_DUPLICATES: u8 = 0x02;
const FLAG_COMPRESS_LEADING: u8 = 0x04;
const FLAG_COMPRESS_TRAILING: u8 = 0x08;
const FLAG_NULL_SUPPRESS: u8 = 0x10;

/// Data type of one key part.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartType {
    /// Raw bytes, compared unsigned
    Char,

    /// Signed 16-bit integer
    Int16,

    /// Signed 32-bit integer
    Int32,

    /// Signed 64-bit integer
    Int64,

    /// IEEE-754 single
    Float32,

    /// IEEE-754 double
    Float64,
}

impl PartType {
    /// Element size in bytes; part lengths must be a multiple of this.
    pub fn unit(self) -> u32 {
        match self {
            Self::Char => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }
}

impl TryFrom<u8> for PartType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(Self::Char),
            1 => Ok(Self::Int16),
            2 => Ok(Self::Int32),
            3 => Ok(Self::Int64),
            4 => Ok(Self::Float32),
            5 => Ok(Self::Float64),
            _ => Err(()),
        }
    }
}

impl From<PartType> for u8 {
    fn from(value: PartType) -> Self {
        match value {
            PartType::Char => 0,
            PartType::Int16 => 1,
            PartType::Int32 => 2,
            PartType::Int64 => 3,
            PartType::Float32 => 4,
            PartType::Float64 => 5,
        }
    }
}

/// One contiguous byte range of a record contributing to a key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyPart {
    /// Byte offset into the record
    pub start: u32,

    /// Length in bytes
    pub len: u32,

    pub kind: PartType,

    /// Inverts the encoded bytes so the part sorts descending
    pub descending: bool,
}

impl KeyPart {
    pub fn ascending(start: u32, len: u32, kind: PartType) -> Self {
        Self {
            start,
            len,
            kind,
            descending: false,
        }
    }

    pub fn descending(start: u32, len: u32, kind: PartType) -> Self {
        Self {
            start,
            len,
            kind,
            descending: true,
        }
    }
}

/// An ordered list of key parts plus per-key flags.
///
/// A descriptor with zero parts is the "null key": it stores no entries and
/// every operation against it is a no-op.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyDescriptor {
    pub parts: Vec<KeyPart>,

    /// Multiple records may share one key value
    pub duplicates: bool,

    /// Records whose key value is null get no index entry
    pub null_suppress: bool,

    pub compress_leading: bool,
    pub compress_trailing: bool,
    pub compress_duplicates: bool,
}

impl KeyDescriptor {
    /// A unique single-part key.
    pub fn unique(part: KeyPart) -> Self {
        Self {
            parts: vec![part],
            ..Self::default()
        }
    }

    /// A single-part key permitting duplicates.
    pub fn with_duplicates(part: KeyPart) -> Self {
        Self {
            parts: vec![part],
            duplicates: true,
            ..Self::default()
        }
    }

    /// Total encoded key length in bytes.
    pub fn key_len(&self) -> usize {
        self.parts.iter().map(|p| p.len as usize).sum()
    }

    pub fn is_null_key(&self) -> bool {
        self.parts.is_empty()
    }

    /// `true` when both descriptors cover the same record bytes in the same
    /// order, ignoring compression flags.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.parts == other.parts
    }

    /// Validates the descriptor against a table's minimum row length.
    pub fn validate(&self, min_row_len: u32) -> Result<()> {
        if self.parts.len() > MAX_KEY_PARTS {
            return Err(Error::BadKey);
        }

        if self.key_len() > MAX_KEY_LEN {
            return Err(Error::BadKey);
        }

        for part in &self.parts {
            if part.len == 0 || part.len % part.kind.unit() != 0 {
                return Err(Error::BadKey);
            }

            let end = u64::from(part.start) + u64::from(part.len);
            if end > u64::from(min_row_len) {
                return Err(Error::BadKey);
            }
        }

        Ok(())
    }

    fn flags_byte(&self) -> u8 {
        let mut flags = 0;
        if self.duplicates {
            flags |= FLAG_DUPLICATES;
        }
        if self.compress_duplicates {
            flags |= FLAG_COMPRESS_DUPLICATES;
        }
        if self.compress_leading {
            flags |= FLAG_COMPRESS_LEADING;
        }
        if self.compress_trailing {
            flags |= FLAG_COMPRESS_TRAILING;
        }
        if self.null_suppress {
            flags |= FLAG_NULL_SUPPRESS;
        }
        flags
    }
}

/// A key descriptor as it lives in the key-descriptor chain, together with
/// the root node of its tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredKey {
    pub root: NodeNo,
    pub desc: KeyDescriptor,
}

impl Encode for StoredKey {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_ptr(writer, self.root)?;
        writer.write_u8(self.desc.flags_byte())?;

        // NOTE: Part count is validated to MAX_KEY_PARTS
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u8(self.desc.parts.len() as u8)?;

        for part in &self.desc.parts {
            writer.write_u16::<BigEndian>(part.start as u16)?;
            writer.write_u16::<BigEndian>(part.len as u16)?;

            let mut kind = u8::from(part.kind);
            if part.descending {
                kind |= DESCENDING_BIT;
            }
            writer.write_u8(kind)?;
        }

        Ok(())
    }
}

impl Decode for StoredKey {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let root = read_ptr(reader)?;
        let flags = reader.read_u8()?;
        let part_count = reader.read_u8()?;

        let mut parts = Vec::with_capacity(part_count.into());

        for _ in 0..part_count {
            let start = u32::from(reader.read_u16::<BigEndian>()?);
            let len = u32::from(reader.read_u16::<BigEndian>()?);
            let kind = reader.read_u8()?;

            let descending = kind & DESCENDING_BIT != 0;
            let kind = (kind & !DESCENDING_BIT)
                .try_into()
                .map_err(|()| DecodeError::InvalidTag(("PartType", kind)))?;

            parts.push(KeyPart {
                start,
                len,
                kind,
                descending,
            });
        }

        Ok(Self {
            root,
            desc: KeyDescriptor {
                parts,
                duplicates: flags & FLAG_DUPLICATES != 0,
                null_suppress: flags & FLAG_NULL_SUPPRESS != 0,
                compress_leading: flags & FLAG_COMPRESS_LEADING != 0,
                compress_trailing: flags & FLAG_COMPRESS_TRAILING != 0,
                compress_duplicates: flags & FLAG_COMPRESS_DUPLICATES != 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn stored_key_roundtrip() -> crate::Result<()> {
        let stored = StoredKey {
            root: 7,
            desc: KeyDescriptor {
                parts: vec![
                    KeyPart::ascending(0, 8, PartType::Char),
                    KeyPart::descending(8, 4, PartType::Int32),
                ],
                duplicates: true,
                null_suppress: false,
                compress_leading: true,
                compress_trailing: false,
                compress_duplicates: true,
            },
        };

        let bytes = stored.encode_into_vec();
        let decoded = StoredKey::decode_from(&mut &bytes[..])?;
        assert_eq!(stored, decoded);

        Ok(())
    }

    #[test]
    fn validation() {
        let desc = KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char));
        assert!(desc.validate(32).is_ok());

        // part beyond the minimum row length
        assert!(desc.validate(4).is_err());

        // numeric length not a multiple of the unit
        let desc = KeyDescriptor::unique(KeyPart::ascending(0, 6, PartType::Int32));
        assert!(desc.validate(32).is_err());

        // zero-length part
        let desc = KeyDescriptor::unique(KeyPart::ascending(0, 0, PartType::Char));
        assert!(desc.validate(32).is_err());

        // null key is fine
        assert!(KeyDescriptor::default().validate(32).is_ok());
    }

    #[test]
    fn shape_ignores_compression() {
        let a = KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char));
        let mut b = a.clone();
        b.compress_leading = true;
        b.duplicates = true;

        assert!(a.same_shape(&b));
        assert_ne!(a, b);
    }
}
