/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Writers that scatter a linear byte stream across a list of block extents.
//!
//! [`DirectExtentWriter`] issues positioned writes against the device file.
//! [`ZeroPadExtentWriter`] stacks on top and rounds the output up to a whole
//! block at finish time. REPLACE_BZ additionally stacks a
//! [`bzip2::write::BzDecoder`] on top of the zero-pad layer, so compressed
//! bytes go in and decompressed blocks come out.

use std::{
    fs::File,
    io::{self, Write},
    os::unix::fs::FileExt,
};

use crate::{format::extent, protobuf::chromeos_update_engine::Extent, util};

/// Scatter-writes a logical byte stream across `extents` in order. A sparse
/// hole extent consumes its share of the stream without issuing any I/O.
/// Writing more bytes than the extents can hold is an error.
pub struct DirectExtentWriter<'a> {
    file: &'a File,
    extents: &'a [Extent],
    block_size: u64,
    /// Index of the extent currently being filled.
    cur: usize,
    /// Bytes already written into the current extent.
    offset_in_extent: u64,
}

impl<'a> DirectExtentWriter<'a> {
    pub fn new(file: &'a File, extents: &'a [Extent], block_size: u64) -> Self {
        Self {
            file,
            extents,
            block_size,
            cur: 0,
            offset_in_extent: 0,
        }
    }
}

impl Write for DirectExtentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;

        while !remaining.is_empty() {
            let Some(extent) = self.extents.get(self.cur) else {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "Extent list exhausted",
                ));
            };

            let extent_size = extent::num_blocks(extent) * self.block_size;
            if self.offset_in_extent == extent_size {
                self.cur += 1;
                self.offset_in_extent = 0;
                continue;
            }

            let n = (extent_size - self.offset_in_extent).min(remaining.len() as u64) as usize;
            if !extent::is_sparse_hole(extent) {
                let offset =
                    extent::start_block(extent) * self.block_size + self.offset_in_extent;
                self.file.write_all_at(&remaining[..n], offset)?;
            }

            self.offset_in_extent += n as u64;
            remaining = &remaining[n..];
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Counts the bytes forwarded to the inner writer and, at finish time, pads
/// with zeros up to the next multiple of the block size.
pub struct ZeroPadExtentWriter<W> {
    inner: W,
    block_size: u64,
    written: u64,
}

impl<W: Write> ZeroPadExtentWriter<W> {
    pub fn new(inner: W, block_size: u64) -> Self {
        Self {
            inner,
            block_size,
            written: 0,
        }
    }

    /// Write the zero padding and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let remainder = self.written % self.block_size;
        if remainder != 0 {
            let mut padding = self.block_size - remainder;
            while padding > 0 {
                let n = padding.min(util::ZEROS.len() as u64) as usize;
                self.inner.write_all(&util::ZEROS[..n])?;
                padding -= n as u64;
            }
        }

        Ok(self.inner)
    }
}

impl<W: Write> Write for ZeroPadExtentWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bzip2::{write::BzEncoder, Compression};

    use super::*;
    use crate::format::extent::SPARSE_HOLE;

    const BLOCK_SIZE: u64 = 16;

    fn extent(start_block: u64, num_blocks: u64) -> Extent {
        Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    fn read_device(file: &File, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    #[test]
    fn direct_writer_crosses_extent_boundaries() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(BLOCK_SIZE * 3).unwrap();

        let extents = [extent(2, 1), extent(0, 1)];
        let mut writer = DirectExtentWriter::new(&file, &extents, BLOCK_SIZE);

        let data = (0u8..24).collect::<Vec<_>>();
        // Odd chunk sizes force writes that straddle the extent boundary.
        for chunk in data.chunks(5) {
            writer.write_all(chunk).unwrap();
        }

        let device = read_device(&file, (BLOCK_SIZE * 3) as usize);
        assert_eq!(&device[32..48], &data[..16]);
        assert_eq!(&device[..8], &data[16..]);
        assert_eq!(&device[8..32], &[0u8; 24]);
    }

    #[test]
    fn direct_writer_discards_sparse_holes() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(BLOCK_SIZE * 2).unwrap();

        let extents = [extent(SPARSE_HOLE, 1), extent(1, 1)];
        let mut writer = DirectExtentWriter::new(&file, &extents, BLOCK_SIZE);

        let data = (0u8..32).collect::<Vec<_>>();
        writer.write_all(&data).unwrap();

        let device = read_device(&file, (BLOCK_SIZE * 2) as usize);
        assert_eq!(&device[..16], &[0u8; 16]);
        assert_eq!(&device[16..], &data[16..]);
    }

    #[test]
    fn direct_writer_rejects_overflow() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(BLOCK_SIZE).unwrap();

        let extents = [extent(0, 1)];
        let mut writer = DirectExtentWriter::new(&file, &extents, BLOCK_SIZE);

        let err = writer.write_all(&vec![0xaa; 17]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn zero_pad_rounds_up_to_block_size() {
        for len in [0usize, 1, 15, 16, 17, 31, 32] {
            let mut writer = ZeroPadExtentWriter::new(Vec::new(), BLOCK_SIZE);
            let data = vec![0xabu8; len];
            writer.write_all(&data).unwrap();
            let out = writer.finish().unwrap();

            assert_eq!(out.len() as u64 % BLOCK_SIZE, 0, "input length {len}");
            assert_eq!(&out[..len], &data[..], "input length {len}");
            assert!(out[len..].iter().all(|&b| b == 0), "input length {len}");
        }
    }

    #[test]
    fn bzip2_stack_decompresses_into_extents() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(BLOCK_SIZE * 2).unwrap();

        let data = vec![0xcdu8; 20];
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&data).unwrap();
        let compressed = encoder.finish().unwrap();

        let extents = [extent(0, 2)];
        let direct = DirectExtentWriter::new(&file, &extents, BLOCK_SIZE);
        let mut zero_pad = ZeroPadExtentWriter::new(direct, BLOCK_SIZE);

        let mut decoder = bzip2::write::BzDecoder::new(&mut zero_pad);
        decoder.write_all(&compressed).unwrap();
        decoder.finish().unwrap();
        drop(decoder);
        zero_pad.finish().unwrap();

        let device = read_device(&file, (BLOCK_SIZE * 2) as usize);
        assert_eq!(&device[..20], &data[..]);
        assert_eq!(&device[20..], &[0u8; 12]);
    }
}
