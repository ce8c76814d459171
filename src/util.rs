/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer};

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Parse a protobuf message from raw (non-length-delimited) bytes.
pub fn read_protobuf<'a, M: MessageRead<'a>>(data: &'a [u8]) -> quick_protobuf::Result<M> {
    let mut reader = BytesReader::from_bytes(data);
    M::from_reader(&mut reader, data)
}

/// Serialize a protobuf message to raw (non-length-delimited) bytes.
pub fn write_protobuf<M: MessageWrite>(message: &M) -> quick_protobuf::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.get_size());
    let mut writer = Writer::new(&mut buf);
    message.write_message(&mut writer)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use crate::protobuf::chromeos_update_engine::Extent;

    #[test]
    fn protobuf_round_trip() {
        let extent = Extent {
            start_block: Some(42),
            num_blocks: Some(7),
        };

        let raw = super::write_protobuf(&extent).unwrap();
        let parsed = super::read_protobuf::<Extent>(&raw).unwrap();
        assert_eq!(parsed, extent);
    }
}
