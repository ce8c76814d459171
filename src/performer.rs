/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The streaming engine that consumes a delta update payload and applies it
//! to the rootfs and kernel partitions.
//!
//! Bytes are pushed in via [`DeltaPerformer::write`] in whatever chunk sizes
//! the downloader produces. The performer buffers them, parses the manifest
//! prefix once enough bytes have arrived, and then executes install
//! operations as soon as each one's data blob is fully buffered. Consumed
//! bytes leave the buffer only through [`DeltaPerformer::discard_buffer_head_bytes`],
//! which feeds the running hash, so the hash always covers exactly the
//! consumed prefix of the payload. After every completed operation the
//! progress checkpoint is persisted to the preferences store.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use bzip2::write::BzDecoder;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    crypto,
    extent_writer::{DirectExtentWriter, ZeroPadExtentWriter},
    format::{
        extent,
        payload::{self, PayloadHeader},
    },
    hash::{ContextError, HashCalculator},
    prefs::{self, Prefs},
    protobuf::chromeos_update_engine::{
        mod_InstallOperation::Type, DeltaArchiveManifest, InstallOperation, Signatures,
    },
    terminator::Terminator,
    util,
};

/// Public key used when the caller does not specify one.
pub const UPDATE_PAYLOAD_PUBLIC_KEY_PATH: &str =
    "/usr/share/update_engine/update-payload-key.pub.pem";

/// Sentinel stored under `update-state-next-operation` to mark progress as
/// unusable for resume.
pub const UPDATE_STATE_OPERATION_INVALID: i64 = -1;

const DEFAULT_BSPATCH_PATH: &str = "bspatch";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device is already open: {0:?}")]
    AlreadyOpen(PathBuf),
    #[error("Applier has been closed")]
    AlreadyClosed,
    #[error("Device is not open")]
    NotOpen,
    #[error("Closed with {0} bytes still buffered")]
    BufferNotEmpty(usize),
    #[error("Payload parse error")]
    Payload(#[from] payload::Error),
    #[error("Operation data at offset {data_offset}, but stream already at {buffer_offset}")]
    StreamRegression { data_offset: u64, buffer_offset: u64 },
    #[error("Blob offset should be {expected}, but is {actual}")]
    InvalidBlobOffset { expected: u64, actual: u64 },
    #[error("Operation needs {needed} data bytes, but only {available} are buffered")]
    ShortBlob { needed: u64, available: u64 },
    #[error("Operation reads {src_blocks} blocks, but writes {dst_blocks} blocks")]
    BlockCountMismatch { src_blocks: u64, dst_blocks: u64 },
    #[error("Extent error")]
    Extent(#[from] extent::Error),
    #[error("Patch program {path:?} exited with {status}")]
    PatchProgram { path: PathBuf, status: ExitStatus },
    #[error("Preferences error")]
    Prefs(#[from] prefs::Error),
    #[error("Hash was not finalized")]
    HashNotFinalized,
    #[error("Expected payload hash {expected:?}, but have {actual:?}")]
    PayloadHashMismatch { expected: String, actual: String },
    #[error("Expected payload size {expected}, but consumed {actual}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },
    #[error("Payload carries no signature message")]
    MissingSignatures,
    #[error("No hash snapshot was taken at the signature boundary")]
    MissingSignedHashContext,
    #[error("Invalid signed hash context")]
    SignedHashContext(#[from] ContextError),
    #[error("Protobuf error")]
    Protobuf(#[from] quick_protobuf::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Returns true if `op` can be interrupted and repeated safely. An operation
/// that reads no device state (no source extents) always produces the same
/// destination bytes, no matter how often it runs.
fn is_idempotent_operation(op: &InstallOperation) -> bool {
    op.src_extents.is_empty()
}

pub struct DeltaPerformer<'a> {
    prefs: &'a dyn Prefs,
    fd: Option<File>,
    path: PathBuf,
    kernel_fd: Option<File>,
    kernel_path: PathBuf,
    closed: bool,
    manifest: Option<DeltaArchiveManifest>,
    manifest_metadata_size: u64,
    block_size: u64,
    /// Received-but-unconsumed bytes; the front corresponds to stream
    /// position `buffer_offset` within the data-blob region.
    buffer: Vec<u8>,
    buffer_offset: u64,
    next_operation_num: usize,
    hash_calculator: HashCalculator,
    signatures_message_data: Vec<u8>,
    signed_hash_context: Option<String>,
    last_updated_buffer_offset: Option<u64>,
    bspatch_path: PathBuf,
}

impl fmt::Debug for DeltaPerformer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaPerformer")
            .field("path", &self.path)
            .field("kernel_path", &self.kernel_path)
            .field("manifest_valid", &self.manifest.is_some())
            .field("buffer_offset", &self.buffer_offset)
            .field("next_operation_num", &self.next_operation_num)
            .finish_non_exhaustive()
    }
}

impl<'a> DeltaPerformer<'a> {
    pub fn new(prefs: &'a dyn Prefs) -> Self {
        Self {
            prefs,
            fd: None,
            path: PathBuf::new(),
            kernel_fd: None,
            kernel_path: PathBuf::new(),
            closed: false,
            manifest: None,
            manifest_metadata_size: 0,
            block_size: 0,
            buffer: Vec::new(),
            buffer_offset: 0,
            next_operation_num: 0,
            hash_calculator: HashCalculator::new(),
            signatures_message_data: Vec::new(),
            signed_hash_context: None,
            last_updated_buffer_offset: None,
            bspatch_path: PathBuf::from(DEFAULT_BSPATCH_PATH),
        }
    }

    /// Override the external patch program. Defaults to `bspatch` resolved
    /// via `PATH`.
    pub fn set_bspatch_path(&mut self, path: impl Into<PathBuf>) {
        self.bspatch_path = path.into();
    }

    /// Open the rootfs partition read/write.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if self.fd.is_some() {
            error!("Rootfs device is already open: {:?}", self.path);
            return Err(Error::AlreadyOpen(self.path.clone()));
        }

        self.fd = Some(OpenOptions::new().read(true).write(true).open(path)?);
        self.path = path.to_owned();
        Ok(())
    }

    /// Open the kernel partition read/write.
    pub fn open_kernel(&mut self, kernel_path: &Path) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if self.kernel_fd.is_some() {
            return Err(Error::AlreadyOpen(self.kernel_path.clone()));
        }

        self.kernel_fd = Some(OpenOptions::new().read(true).write(true).open(kernel_path)?);
        self.kernel_path = kernel_path.to_owned();
        Ok(())
    }

    /// Release the devices and finalize the running hash. Fails if not all
    /// buffered bytes were consumed, which means the payload was truncated
    /// or carried trailing garbage.
    pub fn close(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            error!("Closed with {} bytes still buffered", self.buffer.len());
            return Err(Error::BufferNotEmpty(self.buffer.len()));
        }

        let mut result = Ok(());

        if let Some(kernel_fd) = self.kernel_fd.take() {
            if let Err(e) = kernel_fd.sync_all() {
                warn!("Unable to sync kernel device: {e}");
                result = Err(e.into());
            }
        }
        if let Some(fd) = self.fd.take() {
            if let Err(e) = fd.sync_all() {
                warn!("Unable to sync rootfs device: {e}");
                result = Err(e.into());
            }
        }

        self.closed = true;
        self.path = PathBuf::new();
        self.kernel_path = PathBuf::new();
        self.hash_calculator.finalize();

        result
    }

    /// Accept the next chunk of payload bytes, performing as many actions as
    /// the data received thus far allows. Returns the number of bytes
    /// accepted, which is all of them unless a fatal error occurs.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(data);

        if self.manifest.is_none() {
            let Some(header) = PayloadHeader::parse_prefix(&self.buffer)? else {
                // Not enough bytes to finish the prefix yet.
                return Ok(data.len());
            };

            self.manifest_metadata_size = header.metadata_size;
            self.block_size = u64::from(header.manifest.block_size);
            self.discard_buffer_head_bytes(header.metadata_size as usize);

            if let Err(e) = self
                .prefs
                .set_i64(prefs::MANIFEST_METADATA_SIZE, header.metadata_size as i64)
            {
                warn!("Unable to save the manifest metadata size: {e}");
            }

            debug!(
                version = header.version,
                block_size = self.block_size,
                rootfs_operations = header.manifest.install_operations.len(),
                kernel_operations = header.manifest.kernel_install_operations.len(),
                signatures_offset = ?header.manifest.signatures_offset,
                signatures_size = ?header.manifest.signatures_size,
                "Parsed delta payload manifest",
            );

            self.manifest = Some(header.manifest);
        }

        loop {
            let Some(manifest) = &self.manifest else {
                break;
            };

            let rootfs_operations = manifest.install_operations.len();
            let total_operations =
                rootfs_operations + manifest.kernel_install_operations.len();
            if self.next_operation_num >= total_operations {
                break;
            }

            let is_kernel_partition = self.next_operation_num >= rootfs_operations;
            let op = if is_kernel_partition {
                manifest.kernel_install_operations[self.next_operation_num - rootfs_operations]
                    .clone()
            } else {
                manifest.install_operations[self.next_operation_num].clone()
            };

            if !self.can_perform_install_operation(&op)? {
                break;
            }

            let _exit_unblocker = Terminator::scoped_unblocker();

            // Log every thousandth operation, and also the first and last.
            if self.next_operation_num % 1000 == 0
                || self.next_operation_num + 1 == total_operations
            {
                info!(
                    "Performing operation {}/{}",
                    self.next_operation_num + 1,
                    total_operations,
                );
            }

            // If about to start a non-idempotent operation, clear the update
            // state so that an interrupted run is not resumed mid-operation.
            if !is_idempotent_operation(&op) {
                Terminator::set_exit_blocked(true);
                Self::reset_update_progress(self.prefs)?;
            }

            match op.type_pb {
                Type::REPLACE | Type::REPLACE_BZ => {
                    self.perform_replace_operation(&op, is_kernel_partition)?;
                }
                Type::MOVE => {
                    self.perform_move_operation(&op, is_kernel_partition)?;
                }
                Type::BSDIFF => {
                    self.perform_bsdiff_operation(&op, is_kernel_partition)?;
                }
            }

            self.next_operation_num += 1;
            self.checkpoint_update_progress()?;
        }

        Ok(data.len())
    }

    /// Whether the next pending operation can execute with the data buffered
    /// so far. A regressed stream (operation data before the current stream
    /// position) can never recover and is an error.
    fn can_perform_install_operation(&self, op: &InstallOperation) -> Result<bool> {
        // Move operations don't require any data blob.
        if op.type_pb == Type::MOVE {
            return Ok(true);
        }

        let data_offset = u64::from(op.data_offset.unwrap_or(0));
        let data_length = u64::from(op.data_length.unwrap_or(0));

        if data_offset < self.buffer_offset {
            return Err(Error::StreamRegression {
                data_offset,
                buffer_offset: self.buffer_offset,
            });
        }

        Ok(data_offset + data_length <= self.buffer_offset + self.buffer.len() as u64)
    }

    /// Check that the operation's blob starts exactly at the buffer head and
    /// is fully buffered, and return its length.
    fn check_blob_alignment(&self, op: &InstallOperation) -> Result<u64> {
        let data_offset = u64::from(op.data_offset.unwrap_or(0));
        let data_length = u64::from(op.data_length.unwrap_or(0));

        // Bytes are deleted off the front of the buffer as they are
        // consumed, so the blob must sit exactly at the head.
        if data_offset != self.buffer_offset {
            return Err(Error::InvalidBlobOffset {
                expected: self.buffer_offset,
                actual: data_offset,
            });
        }
        if (self.buffer.len() as u64) < data_length {
            return Err(Error::ShortBlob {
                needed: data_length,
                available: self.buffer.len() as u64,
            });
        }

        Ok(data_length)
    }

    fn target_file(&self, is_kernel_partition: bool) -> Result<&File> {
        let fd = if is_kernel_partition {
            self.kernel_fd.as_ref()
        } else {
            self.fd.as_ref()
        };

        fd.ok_or(Error::NotOpen)
    }

    fn perform_replace_operation(
        &mut self,
        op: &InstallOperation,
        is_kernel_partition: bool,
    ) -> Result<()> {
        let data_length = self.check_blob_alignment(op)?;

        // Extract the signature message if it's in this operation.
        self.extract_signature_message(op);

        let file = self.target_file(is_kernel_partition)?;
        let data = &self.buffer[..data_length as usize];

        let direct = DirectExtentWriter::new(file, &op.dst_extents, self.block_size);
        let mut writer = ZeroPadExtentWriter::new(direct, self.block_size);

        match op.type_pb {
            Type::REPLACE => {
                writer.write_all(data)?;
            }
            Type::REPLACE_BZ => {
                let mut decoder = BzDecoder::new(&mut writer);
                decoder.write_all(data)?;
                decoder.finish()?;
            }
            _ => unreachable!("dispatched with a non-replace operation"),
        }

        writer.finish()?;

        self.buffer_offset += data_length;
        self.discard_buffer_head_bytes(data_length as usize);
        Ok(())
    }

    /// Gather all source extents into memory, then scatter to the
    /// destination extents. No sliding window is needed for overlapping
    /// extents; the payload generator is responsible for avoiding overlap
    /// that would corrupt the result.
    fn perform_move_operation(
        &mut self,
        op: &InstallOperation,
        is_kernel_partition: bool,
    ) -> Result<()> {
        let src_blocks = extent::total_blocks(&op.src_extents);
        let dst_blocks = extent::total_blocks(&op.dst_extents);
        if src_blocks != dst_blocks {
            return Err(Error::BlockCountMismatch {
                src_blocks,
                dst_blocks,
            });
        }

        let file = self.target_file(is_kernel_partition)?;
        let mut buf = vec![0u8; (src_blocks * self.block_size) as usize];

        let mut offset = 0;
        for e in &op.src_extents {
            let len = (extent::num_blocks(e) * self.block_size) as usize;
            // A sparse hole reads as zeros, which the buffer already holds.
            if !extent::is_sparse_hole(e) {
                file.read_exact_at(
                    &mut buf[offset..offset + len],
                    extent::start_block(e) * self.block_size,
                )?;
            }
            offset += len;
        }

        let mut offset = 0;
        for e in &op.dst_extents {
            let len = (extent::num_blocks(e) * self.block_size) as usize;
            if !extent::is_sparse_hole(e) {
                file.write_all_at(
                    &buf[offset..offset + len],
                    extent::start_block(e) * self.block_size,
                )?;
            }
            offset += len;
        }

        Ok(())
    }

    fn perform_bsdiff_operation(
        &mut self,
        op: &InstallOperation,
        is_kernel_partition: bool,
    ) -> Result<()> {
        let data_length = self.check_blob_alignment(op)?;

        let src_positions = extent::bsdiff_positions(
            &op.src_extents,
            self.block_size,
            op.src_length.unwrap_or(0),
        )?;
        let dst_positions = extent::bsdiff_positions(
            &op.dst_extents,
            self.block_size,
            op.dst_length.unwrap_or(0),
        )?;

        // The patch tool reads the patch from a file; it is unlinked on
        // every exit path when this handle drops.
        let mut patch_file = NamedTempFile::new()?;
        patch_file.write_all(&self.buffer[..data_length as usize])?;
        patch_file.flush()?;

        let file = self.target_file(is_kernel_partition)?;
        let path = if is_kernel_partition {
            &self.kernel_path
        } else {
            &self.path
        };

        // In-place patching: the same device is both the read-old and
        // write-new target.
        let status = Command::new(&self.bspatch_path)
            .arg(path)
            .arg(path)
            .arg(patch_file.path())
            .arg(&src_positions)
            .arg(&dst_positions)
            .status()?;
        if !status.success() {
            return Err(Error::PatchProgram {
                path: self.bspatch_path.clone(),
                status,
            });
        }

        let dst_length = op.dst_length.unwrap_or(0);
        if dst_length % self.block_size != 0 {
            // Zero out the rest of the final block past the patch output.
            if let Some(last_extent) = op.dst_extents.last() {
                if !extent::is_sparse_hole(last_extent) {
                    let end_byte = (extent::start_block(last_extent)
                        + extent::num_blocks(last_extent))
                        * self.block_size;
                    let begin_byte =
                        end_byte - (self.block_size - dst_length % self.block_size);
                    let zeros = vec![0u8; (end_byte - begin_byte) as usize];
                    file.write_all_at(&zeros, begin_byte)?;
                }
            }
        }

        self.buffer_offset += data_length;
        self.discard_buffer_head_bytes(data_length as usize);
        Ok(())
    }

    /// A REPLACE operation whose blob sits at the manifest's signature
    /// placement carries the signature message rather than device content.
    /// Copy it out and snapshot the hash over everything that precedes it;
    /// that hash is what the signature attests to. The operation itself
    /// still proceeds as a normal write.
    fn extract_signature_message(&mut self, op: &InstallOperation) {
        let (signatures_offset, signatures_size) = match &self.manifest {
            Some(manifest) => match (manifest.signatures_offset, manifest.signatures_size) {
                (Some(offset), Some(size)) => (offset, size),
                _ => return,
            },
            None => return,
        };

        if op.type_pb != Type::REPLACE
            || u64::from(op.data_offset.unwrap_or(0)) != signatures_offset
        {
            return;
        }

        if u64::from(op.data_length.unwrap_or(0)) != signatures_size {
            warn!("Signature operation length does not match the manifest; skipping extraction");
            return;
        }
        if !self.signatures_message_data.is_empty() {
            warn!("Signature message was already extracted");
            return;
        }
        if self.buffer_offset != signatures_offset
            || (self.buffer.len() as u64) < signatures_size
        {
            warn!("Signature blob is not fully buffered; skipping extraction");
            return;
        }

        self.signatures_message_data = self.buffer[..signatures_size as usize].to_vec();

        // The hash of all data consumed so far is what was signed.
        let context = self.hash_calculator.context();
        if let Err(e) = self
            .prefs
            .set_string(prefs::UPDATE_STATE_SIGNED_SHA256_CONTEXT, &context)
        {
            warn!("Unable to store the signed hash context: {e}");
        }
        self.signed_hash_context = Some(context);

        info!("Extracted signature data of size {signatures_size} at {signatures_offset}");
    }

    /// Verify the complete payload after the stream has been fully consumed
    /// and the applier closed.
    ///
    /// Checks, in order: the hash over all consumed bytes against
    /// `expected_hash` (base64), the consumed byte count against
    /// `expected_size`, and the signature message against the public key.
    /// When the key file does not exist, signature verification is skipped
    /// with a warning and the payload is accepted on the strength of the
    /// hash check alone.
    pub fn verify_payload(
        &self,
        public_key_path: Option<&Path>,
        expected_hash: &str,
        expected_size: u64,
    ) -> Result<()> {
        let key_path =
            public_key_path.unwrap_or_else(|| Path::new(UPDATE_PAYLOAD_PUBLIC_KEY_PATH));
        info!("Verifying delta payload. Public key path: {key_path:?}");

        let actual_hash = self.hash_calculator.hash().ok_or(Error::HashNotFinalized)?;
        if actual_hash != expected_hash {
            return Err(Error::PayloadHashMismatch {
                expected: expected_hash.to_owned(),
                actual: actual_hash,
            });
        }

        let actual_size = self.manifest_metadata_size + self.buffer_offset;
        if expected_size != actual_size {
            return Err(Error::PayloadSizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }

        if !key_path.exists() {
            warn!("Not verifying signed delta payload -- missing public key");
            return Ok(());
        }

        if self.signatures_message_data.is_empty() {
            return Err(Error::MissingSignatures);
        }
        let signatures: Signatures = util::read_protobuf(&self.signatures_message_data)?;
        let public_key = crypto::read_pem_public_key_file(key_path)?;

        // Rebuild the hash as it stood just before the signature blob. The
        // snapshot is not reloaded from the preferences store after a
        // restart, so an update resumed past the signature point fails here
        // rather than verifying against a synthesized context.
        let context = self
            .signed_hash_context
            .as_ref()
            .ok_or(Error::MissingSignedHashContext)?;
        let mut signed_hasher = HashCalculator::new();
        signed_hasher.set_context(context)?;
        signed_hasher.finalize();
        let digest = signed_hasher
            .raw_hash()
            .copied()
            .ok_or(Error::HashNotFinalized)?;
        debug!("Signed payload hash: {}", hex::encode(digest));

        crypto::verify_digest(&digest, &signatures, &public_key)?;
        Ok(())
    }

    /// All bytes leave the buffer through here, so the running hash covers
    /// exactly the consumed prefix of the payload.
    fn discard_buffer_head_bytes(&mut self, count: usize) {
        self.hash_calculator.update(&self.buffer[..count]);
        self.buffer.drain(..count);
    }

    /// Persist the progress checkpoint. The write order is load-bearing:
    /// `next-operation` is reset first and written last, so a crash between
    /// any two writes leaves the sentinel in place and resume is refused
    /// rather than resumed against mismatched state.
    fn checkpoint_update_progress(&mut self) -> Result<()> {
        Terminator::set_exit_blocked(true);

        if self.last_updated_buffer_offset != Some(self.buffer_offset) {
            Self::reset_update_progress(self.prefs)?;
            self.prefs.set_string(
                prefs::UPDATE_STATE_SHA256_CONTEXT,
                &self.hash_calculator.context(),
            )?;
            self.prefs.set_i64(
                prefs::UPDATE_STATE_NEXT_DATA_OFFSET,
                self.buffer_offset as i64,
            )?;
            self.last_updated_buffer_offset = Some(self.buffer_offset);
        }

        self.prefs.set_i64(
            prefs::UPDATE_STATE_NEXT_OPERATION,
            self.next_operation_num as i64,
        )?;
        Ok(())
    }

    /// Whether the preferences store holds a checkpoint consistent enough to
    /// resume the update whose payload hashes to
    /// `update_check_response_hash`. Any absent or mismatched field means
    /// the caller must start from scratch.
    pub fn can_resume_update(prefs: &dyn Prefs, update_check_response_hash: &str) -> bool {
        let next_operation = match prefs.get_i64(prefs::UPDATE_STATE_NEXT_OPERATION) {
            Ok(Some(value)) => value,
            _ => return false,
        };
        if next_operation == UPDATE_STATE_OPERATION_INVALID || next_operation <= 0 {
            return false;
        }

        let interrupted_hash = match prefs.get_string(prefs::UPDATE_CHECK_RESPONSE_HASH) {
            Ok(Some(value)) => value,
            _ => return false,
        };
        if interrupted_hash.is_empty() || interrupted_hash != update_check_response_hash {
            return false;
        }

        // Sanity check the rest.
        match prefs.get_i64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET) {
            Ok(Some(next_data_offset)) if next_data_offset >= 0 => {}
            _ => return false,
        }

        match prefs.get_string(prefs::UPDATE_STATE_SHA256_CONTEXT) {
            Ok(Some(context)) if !context.is_empty() => {}
            _ => return false,
        }

        match prefs.get_i64(prefs::MANIFEST_METADATA_SIZE) {
            Ok(Some(manifest_metadata_size)) if manifest_metadata_size > 0 => {}
            _ => return false,
        }

        true
    }

    /// Invalidate any persisted progress so the next run starts fresh.
    pub fn reset_update_progress(prefs: &dyn Prefs) -> Result<()> {
        prefs.set_i64(
            prefs::UPDATE_STATE_NEXT_OPERATION,
            UPDATE_STATE_OPERATION_INVALID,
        )?;
        Ok(())
    }
}
