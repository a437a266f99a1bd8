// Copyright 2020 Joyent, Inc.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use crc16::{State, ARC};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Code, Error, Result};

pub const MAGIC_LENGTH: usize = 10;

pub const BLOCK_HEADER_VERSION_LATEST: u16 = 1;

/*
 * Base header layouts.  All integers are little-endian.
 *
 * version 0 (26 bytes):
 *   magic[10] header_len[1] compression_type[1] data_checksum[4]
 *   data_length[4] data_zlength[4] header_checksum[2]
 *
 * version 1 (28 bytes):
 *   magic[10] header_checksum[2] flags[2] header_len[1]
 *   compression_type[1] data_checksum[4] data_length[4] data_zlength[4]
 *
 * Extended headers insert their own fields after data_zlength (and, for
 * version 0, before the trailing checksum).  The version 0 checksum covers
 * everything before it; the version 1 checksum covers bytes 12..end.
 */
const V0_BASE_LENGTH: usize = 26;
const V1_BASE_LENGTH: usize = 28;
const V1_CHECKSUM_OFFSET: usize = MAGIC_LENGTH;
const V1_CHECKSUM_COVERS: usize = MAGIC_LENGTH + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum CompressionType {
    None = 0,
    Bmz = 1,
    Zlib = 2,
    Lzo = 3,
    Quicklz = 4,
    Snappy = 5,
}

pub const COMPRESSION_TYPE_LIMIT: u8 = 6;

impl CompressionType {
    pub fn from_u8(value: u8) -> Option<CompressionType> {
        FromPrimitive::from_u8(value)
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Bmz => "bmz",
            CompressionType::Zlib => "zlib",
            CompressionType::Lzo => "lzo",
            CompressionType::Quicklz => "quicklz",
            CompressionType::Snappy => "snappy",
        }
    }
}

fn header_checksum(data: &[u8]) -> u16 {
    State::<ARC>::calculate(data)
}

/// Fields common to every compressed block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u16,
    pub magic: [u8; MAGIC_LENGTH],
    pub flags: u16,
    pub compression_type: CompressionType,
    pub data_checksum: u32,
    pub data_length: u32,
    pub data_zlength: u32,
}

impl BlockHeader {
    pub fn new(version: u16, magic: &[u8; MAGIC_LENGTH]) -> BlockHeader {
        BlockHeader {
            version,
            magic: *magic,
            flags: 0,
            compression_type: CompressionType::None,
            data_checksum: 0,
            data_length: 0,
            data_zlength: 0,
        }
    }

    pub fn base_length(version: u16) -> usize {
        if version == 0 {
            V0_BASE_LENGTH
        } else {
            V1_BASE_LENGTH
        }
    }

    pub fn encoded_length(&self) -> usize {
        BlockHeader::base_length(self.version)
    }

    pub fn check_magic(&self, magic: &[u8; MAGIC_LENGTH]) -> bool {
        &self.magic == magic
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.encode_with(buf, &[])
    }

    pub fn decode(buf: &[u8], version: u16) -> Result<BlockHeader> {
        BlockHeader::decode_with(buf, version, 0).map(|(header, _)| header)
    }

    /// Encodes the base fields around `extension`, then stamps the header
    /// checksum.
    pub(crate) fn encode_with(&self, buf: &mut BytesMut, extension: &[u8]) {
        let total = self.encoded_length() + extension.len();
        let start = buf.len();
        buf.reserve(total);
        buf.put_slice(&self.magic);
        if self.version != 0 {
            buf.put_u16_le(0);
            buf.put_u16_le(self.flags);
        }
        buf.put_u8(total as u8);
        buf.put_u8(self.compression_type as u8);
        buf.put_u32_le(self.data_checksum);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.data_zlength);
        buf.put_slice(extension);
        if self.version == 0 {
            let sum = header_checksum(&buf[start..]);
            buf.put_u16_le(sum);
        } else {
            let sum = header_checksum(&buf[start + V1_CHECKSUM_COVERS..]);
            LittleEndian::write_u16(
                &mut buf[start + V1_CHECKSUM_OFFSET..start + V1_CHECKSUM_OFFSET + 2],
                sum,
            );
        }
    }

    /// Decodes a header carrying `extension_len` bytes of extra fields and
    /// returns those bytes alongside the base fields.
    pub(crate) fn decode_with(
        buf: &[u8],
        version: u16,
        extension_len: usize,
    ) -> Result<(BlockHeader, &[u8])> {
        let total = BlockHeader::base_length(version) + extension_len;
        if buf.len() < total {
            return Err(Error::new(
                Code::BlockCompressorTruncated,
                format!("block header needs {} bytes, have {}", total, buf.len()),
            ));
        }
        let buf = &buf[..total];

        let mut magic = [0u8; MAGIC_LENGTH];
        magic.copy_from_slice(&buf[..MAGIC_LENGTH]);
        let mut pos = MAGIC_LENGTH;

        let mut flags = 0;
        if version == 0 {
            let stored = LittleEndian::read_u16(&buf[total - 2..]);
            let computed = header_checksum(&buf[..total - 2]);
            if stored != computed {
                return Err(checksum_error(stored, computed));
            }
        } else {
            let stored = LittleEndian::read_u16(&buf[pos..pos + 2]);
            let computed = header_checksum(&buf[V1_CHECKSUM_COVERS..]);
            if stored != computed {
                return Err(checksum_error(stored, computed));
            }
            flags = LittleEndian::read_u16(&buf[pos + 2..pos + 4]);
            pos += 4;
        }

        let header_len = buf[pos] as usize;
        if header_len != total {
            return Err(Error::new(
                Code::BlockCompressorBadHeader,
                format!(
                    "unexpected header length: {}, expecting: {}",
                    header_len, total
                ),
            ));
        }
        let ctype = buf[pos + 1];
        let compression_type = CompressionType::from_u8(ctype).ok_or_else(|| {
            Error::new(
                Code::BlockCompressorBadHeader,
                format!("unsupported compression type ({})", ctype),
            )
        })?;
        pos += 2;
        let data_checksum = LittleEndian::read_u32(&buf[pos..pos + 4]);
        let data_length = LittleEndian::read_u32(&buf[pos + 4..pos + 8]);
        let data_zlength = LittleEndian::read_u32(&buf[pos + 8..pos + 12]);
        pos += 12;

        let header = BlockHeader {
            version,
            magic,
            flags,
            compression_type,
            data_checksum,
            data_length,
            data_zlength,
        };
        Ok((header, &buf[pos..pos + extension_len]))
    }
}

fn checksum_error(stored: u16, computed: u16) -> Error {
    Error::new(
        Code::BlockCompressorBadHeader,
        format!(
            "header checksum mismatch: {} (computed) != {} (stored)",
            computed, stored
        ),
    )
}

/// Block header of a commit-log block: the base header plus the highest
/// revision in the block and, from version 1 on, the originating cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaderCommitLog {
    pub base: BlockHeader,
    pub revision: i64,
    pub cluster_id: u64,
}

impl BlockHeaderCommitLog {
    pub fn new(version: u16) -> BlockHeaderCommitLog {
        BlockHeaderCommitLog {
            base: BlockHeader::new(version, &[0u8; MAGIC_LENGTH]),
            revision: 0,
            cluster_id: 0,
        }
    }

    pub fn with_magic(
        magic: &[u8; MAGIC_LENGTH],
        revision: i64,
        cluster_id: u64,
    ) -> BlockHeaderCommitLog {
        BlockHeaderCommitLog {
            base: BlockHeader::new(BLOCK_HEADER_VERSION_LATEST, magic),
            revision,
            cluster_id,
        }
    }

    fn extension_length(version: u16) -> usize {
        if version == 0 {
            8
        } else {
            16
        }
    }

    pub fn encoded_length_for(version: u16) -> usize {
        BlockHeader::base_length(version) + BlockHeaderCommitLog::extension_length(version)
    }

    pub fn version(&self) -> u16 {
        self.base.version
    }

    pub fn get_revision(&self) -> i64 {
        self.revision
    }

    /// Always 0 for version 0 headers, which have no cluster id field.
    pub fn get_cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn check_magic(&self, magic: &[u8; MAGIC_LENGTH]) -> bool {
        self.base.check_magic(magic)
    }
}

/// Shared interface of the block header flavors, used by the compression
/// codecs to fill in and read back the base fields.
pub trait BlockHeaderEncoding {
    fn base(&self) -> &BlockHeader;
    fn base_mut(&mut self) -> &mut BlockHeader;
    fn encoded_length(&self) -> usize;
    fn encode(&self, buf: &mut BytesMut);
    /// Decodes from the front of `buf` using this header's version.
    fn decode_from(&mut self, buf: &[u8]) -> Result<()>;
}

impl BlockHeaderEncoding for BlockHeader {
    fn base(&self) -> &BlockHeader {
        self
    }

    fn base_mut(&mut self) -> &mut BlockHeader {
        self
    }

    fn encoded_length(&self) -> usize {
        BlockHeader::encoded_length(self)
    }

    fn encode(&self, buf: &mut BytesMut) {
        BlockHeader::encode(self, buf)
    }

    fn decode_from(&mut self, buf: &[u8]) -> Result<()> {
        *self = BlockHeader::decode(buf, self.version)?;
        Ok(())
    }
}

impl BlockHeaderEncoding for BlockHeaderCommitLog {
    fn base(&self) -> &BlockHeader {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BlockHeader {
        &mut self.base
    }

    fn encoded_length(&self) -> usize {
        BlockHeaderCommitLog::encoded_length_for(self.base.version)
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut extension = [0u8; 16];
        LittleEndian::write_i64(&mut extension[..8], self.revision);
        let len = if self.base.version == 0 {
            8
        } else {
            LittleEndian::write_u64(&mut extension[8..], self.cluster_id);
            16
        };
        self.base.encode_with(buf, &extension[..len]);
    }

    fn decode_from(&mut self, buf: &[u8]) -> Result<()> {
        let version = self.base.version;
        let (base, extension) = BlockHeader::decode_with(
            buf,
            version,
            BlockHeaderCommitLog::extension_length(version),
        )?;
        self.revision = LittleEndian::read_i64(&extension[..8]);
        self.cluster_id = if version == 0 {
            0
        } else {
            LittleEndian::read_u64(&extension[8..16])
        };
        self.base = base;
        Ok(())
    }
}
