// Automatically generated rust module for 'update_metadata.proto' file

#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(unused_imports)]
#![allow(unknown_lints)]
#![allow(clippy::all)]
#![cfg_attr(rustfmt, rustfmt_skip)]

use quick_protobuf::{MessageRead, MessageWrite, BytesReader, Writer, WriterBackend, Result};
use quick_protobuf::sizeofs::*;

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Extent {
    pub start_block: Option<u64>,
    pub num_blocks: Option<u64>,
}

impl<'a> MessageRead<'a> for Extent {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.start_block = Some(r.read_uint64(bytes)?),
                Ok(16) => msg.num_blocks = Some(r.read_uint64(bytes)?),
                Ok(t) => { r.read_unknown(bytes, t)?; }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Extent {
    fn get_size(&self) -> usize {
        0
        + self.start_block.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
        + self.num_blocks.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        if let Some(ref s) = self.start_block { w.write_with_tag(8, |w| w.write_uint64(*s))?; }
        if let Some(ref s) = self.num_blocks { w.write_with_tag(16, |w| w.write_uint64(*s))?; }
        Ok(())
    }
}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Signatures {
    pub signatures: Vec<mod_Signatures::Signature>,
}

impl<'a> MessageRead<'a> for Signatures {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.signatures.push(r.read_message::<mod_Signatures::Signature>(bytes)?),
                Ok(t) => { r.read_unknown(bytes, t)?; }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Signatures {
    fn get_size(&self) -> usize {
        0
        + self.signatures.iter().map(|s| 1 + sizeof_len((s).get_size())).sum::<usize>()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        for s in &self.signatures { w.write_with_tag(10, |w| w.write_message(s))?; }
        Ok(())
    }
}

pub mod mod_Signatures {

use super::*;

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Signature {
    pub version: Option<u32>,
    pub data: Option<Vec<u8>>,
}

impl<'a> MessageRead<'a> for Signature {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.version = Some(r.read_uint32(bytes)?),
                Ok(18) => msg.data = Some(r.read_bytes(bytes)?.to_owned()),
                Ok(t) => { r.read_unknown(bytes, t)?; }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Signature {
    fn get_size(&self) -> usize {
        0
        + self.version.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
        + self.data.as_ref().map_or(0, |m| 1 + sizeof_len((m).len()))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        if let Some(ref s) = self.version { w.write_with_tag(8, |w| w.write_uint32(*s))?; }
        if let Some(ref s) = self.data { w.write_with_tag(18, |w| w.write_bytes(&**s))?; }
        Ok(())
    }
}

}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Default, PartialEq, Clone)]
pub struct InstallOperation {
    pub type_pb: mod_InstallOperation::Type,
    pub data_offset: Option<u32>,
    pub data_length: Option<u32>,
    pub src_extents: Vec<Extent>,
    pub src_length: Option<u64>,
    pub dst_extents: Vec<Extent>,
    pub dst_length: Option<u64>,
}

impl<'a> MessageRead<'a> for InstallOperation {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.type_pb = r.read_enum(bytes)?,
                Ok(16) => msg.data_offset = Some(r.read_uint32(bytes)?),
                Ok(24) => msg.data_length = Some(r.read_uint32(bytes)?),
                Ok(34) => msg.src_extents.push(r.read_message::<Extent>(bytes)?),
                Ok(40) => msg.src_length = Some(r.read_uint64(bytes)?),
                Ok(50) => msg.dst_extents.push(r.read_message::<Extent>(bytes)?),
                Ok(56) => msg.dst_length = Some(r.read_uint64(bytes)?),
                Ok(t) => { r.read_unknown(bytes, t)?; }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for InstallOperation {
    fn get_size(&self) -> usize {
        0
        + 1 + sizeof_varint(*(&self.type_pb) as u64)
        + self.data_offset.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
        + self.data_length.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
        + self.src_extents.iter().map(|s| 1 + sizeof_len((s).get_size())).sum::<usize>()
        + self.src_length.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
        + self.dst_extents.iter().map(|s| 1 + sizeof_len((s).get_size())).sum::<usize>()
        + self.dst_length.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_enum(*&self.type_pb as i32))?;
        if let Some(ref s) = self.data_offset { w.write_with_tag(16, |w| w.write_uint32(*s))?; }
        if let Some(ref s) = self.data_length { w.write_with_tag(24, |w| w.write_uint32(*s))?; }
        for s in &self.src_extents { w.write_with_tag(34, |w| w.write_message(s))?; }
        if let Some(ref s) = self.src_length { w.write_with_tag(40, |w| w.write_uint64(*s))?; }
        for s in &self.dst_extents { w.write_with_tag(50, |w| w.write_message(s))?; }
        if let Some(ref s) = self.dst_length { w.write_with_tag(56, |w| w.write_uint64(*s))?; }
        Ok(())
    }
}

pub mod mod_InstallOperation {


#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Type {
    REPLACE = 0,
    REPLACE_BZ = 1,
    MOVE = 2,
    BSDIFF = 3,
}

impl Default for Type {
    fn default() -> Self {
        Type::REPLACE
    }
}

impl From<i32> for Type {
    fn from(i: i32) -> Self {
        match i {
            0 => Type::REPLACE,
            1 => Type::REPLACE_BZ,
            2 => Type::MOVE,
            3 => Type::BSDIFF,
            _ => Self::default(),
        }
    }
}

impl<'a> From<&'a str> for Type {
    fn from(s: &'a str) -> Self {
        match s {
            "REPLACE" => Type::REPLACE,
            "REPLACE_BZ" => Type::REPLACE_BZ,
            "MOVE" => Type::MOVE,
            "BSDIFF" => Type::BSDIFF,
            _ => Self::default(),
        }
    }
}

}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, PartialEq, Clone)]
pub struct DeltaArchiveManifest {
    pub install_operations: Vec<InstallOperation>,
    pub kernel_install_operations: Vec<InstallOperation>,
    pub block_size: u32,
    pub signatures_offset: Option<u64>,
    pub signatures_size: Option<u64>,
}

impl Default for DeltaArchiveManifest {
    fn default() -> Self {
        Self {
            install_operations: Vec::new(),
            kernel_install_operations: Vec::new(),
            block_size: 4096u32,
            signatures_offset: None,
            signatures_size: None,
        }
    }
}

impl<'a> MessageRead<'a> for DeltaArchiveManifest {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.install_operations.push(r.read_message::<InstallOperation>(bytes)?),
                Ok(18) => msg.kernel_install_operations.push(r.read_message::<InstallOperation>(bytes)?),
                Ok(24) => msg.block_size = r.read_uint32(bytes)?,
                Ok(32) => msg.signatures_offset = Some(r.read_uint64(bytes)?),
                Ok(40) => msg.signatures_size = Some(r.read_uint64(bytes)?),
                Ok(t) => { r.read_unknown(bytes, t)?; }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for DeltaArchiveManifest {
    fn get_size(&self) -> usize {
        0
        + self.install_operations.iter().map(|s| 1 + sizeof_len((s).get_size())).sum::<usize>()
        + self.kernel_install_operations.iter().map(|s| 1 + sizeof_len((s).get_size())).sum::<usize>()
        + if self.block_size == 4096u32 { 0 } else { 1 + sizeof_varint(*(&self.block_size) as u64) }
        + self.signatures_offset.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
        + self.signatures_size.as_ref().map_or(0, |m| 1 + sizeof_varint(*(m) as u64))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        for s in &self.install_operations { w.write_with_tag(10, |w| w.write_message(s))?; }
        for s in &self.kernel_install_operations { w.write_with_tag(18, |w| w.write_message(s))?; }
        if self.block_size != 4096u32 { w.write_with_tag(24, |w| w.write_uint32(*&self.block_size))?; }
        if let Some(ref s) = self.signatures_offset { w.write_with_tag(32, |w| w.write_uint64(*s))?; }
        if let Some(ref s) = self.signatures_size { w.write_with_tag(40, |w| w.write_uint64(*s))?; }
        Ok(())
    }
}
