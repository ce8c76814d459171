/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use byteorder::{BigEndian, ByteOrder};
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::{protobuf::chromeos_update_engine::DeltaArchiveManifest, util};

pub const DELTA_MAGIC: &[u8; 4] = b"CrAU";

const DELTA_VERSION_SIZE: usize = 8;
const DELTA_PROTOBUF_LENGTH_SIZE: usize = 8;

/// Bytes needed before the protobuf length is known.
const PREFIX_FIXED_SIZE: usize = DELTA_MAGIC.len() + DELTA_VERSION_SIZE + DELTA_PROTOBUF_LENGTH_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Protobuf error")]
    Protobuf(#[from] quick_protobuf::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The parsed payload prefix: everything from the start of the stream
/// through the manifest protobuf. The data-blob region begins at
/// `metadata_size`.
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_size: u64,
}

impl PayloadHeader {
    /// Try to parse the payload prefix from the head of `buffer`. Returns
    /// `Ok(None)` when the buffer does not yet hold the complete prefix;
    /// the caller should retry once more bytes have arrived.
    pub fn parse_prefix(buffer: &[u8]) -> Result<Option<Self>> {
        if buffer.len() < PREFIX_FIXED_SIZE {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buffer[..DELTA_MAGIC.len()]);
        if magic != *DELTA_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = BigEndian::read_u64(&buffer[DELTA_MAGIC.len()..][..DELTA_VERSION_SIZE]);
        let manifest_size = BigEndian::read_u64(
            &buffer[DELTA_MAGIC.len() + DELTA_VERSION_SIZE..][..DELTA_PROTOBUF_LENGTH_SIZE],
        )
        .to_usize()
        .ok_or(Error::IntegerTooLarge("manifest_size"))?;

        if buffer.len() < PREFIX_FIXED_SIZE + manifest_size {
            return Ok(None);
        }

        let manifest_raw = &buffer[PREFIX_FIXED_SIZE..][..manifest_size];
        let manifest: DeltaArchiveManifest = util::read_protobuf(manifest_raw)?;

        Ok(Some(Self {
            version,
            manifest,
            metadata_size: (PREFIX_FIXED_SIZE + manifest_size) as u64,
        }))
    }
}
