// Copyright 2020 Joyent, Inc.

use std::io::{Read, Write};

use bytes::BytesMut;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::commitlog::block_header::{BlockHeaderEncoding, CompressionType};
use crate::error::{Code, Error, Result};

/// A block compression algorithm.
///
/// `deflate` writes `[header][compressed data]` into `output`, filling in the
/// header's length, checksum and compression type fields, and leaves `reserve`
/// bytes of spare capacity after the data.  `inflate` takes the same layout
/// back, verifies it and writes the uncompressed data into `output`.
pub trait BlockCompressionCodec: Send {
    fn compression_type(&self) -> CompressionType;

    fn deflate(
        &mut self,
        input: &[u8],
        output: &mut BytesMut,
        header: &mut dyn BlockHeaderEncoding,
        reserve: usize,
    ) -> Result<()>;

    fn inflate(
        &mut self,
        input: &[u8],
        output: &mut BytesMut,
        header: &mut dyn BlockHeaderEncoding,
    ) -> Result<()>;
}

pub fn create_block_codec(name: &str) -> Result<Box<dyn BlockCompressionCodec>> {
    match name.to_ascii_lowercase().as_str() {
        "none" => create_block_codec_for(CompressionType::None),
        "zlib" => create_block_codec_for(CompressionType::Zlib),
        "bmz" | "lzo" | "quicklz" | "snappy" => Err(Error::new(
            Code::BlockCompressorUnsupportedType,
            format!("compressor '{}' is not available in this build", name),
        )),
        _ => Err(Error::new(
            Code::BlockCompressorUnsupportedType,
            format!("unknown compressor '{}'", name),
        )),
    }
}

pub fn create_block_codec_for(
    ctype: CompressionType,
) -> Result<Box<dyn BlockCompressionCodec>> {
    match ctype {
        CompressionType::None => Ok(Box::new(NoneCodec)),
        CompressionType::Zlib => Ok(Box::new(ZlibCodec::default())),
        other => Err(Error::new(
            Code::BlockCompressorUnsupportedType,
            format!("unsupported compression type '{}'", other.name()),
        )),
    }
}

fn stamp(
    input_len: usize,
    zdata: &[u8],
    ctype: CompressionType,
    output: &mut BytesMut,
    header: &mut dyn BlockHeaderEncoding,
    reserve: usize,
) {
    let base = header.base_mut();
    base.compression_type = ctype;
    base.data_length = input_len as u32;
    base.data_zlength = zdata.len() as u32;
    base.data_checksum = crc32c::crc32c(zdata);

    output.clear();
    output.reserve(header.encoded_length() + zdata.len() + reserve);
    header.encode(output);
    output.extend_from_slice(zdata);
}

/// Decodes the header at the front of `input` and returns the verified
/// compressed body.
fn verified_body<'a>(
    input: &'a [u8],
    header: &mut dyn BlockHeaderEncoding,
) -> Result<&'a [u8]> {
    header.decode_from(input)?;
    let body = &input[header.encoded_length()..];
    let zlength = header.base().data_zlength as usize;
    if body.len() < zlength {
        return Err(Error::new(
            Code::BlockCompressorTruncated,
            format!("block body needs {} bytes, have {}", zlength, body.len()),
        ));
    }
    let body = &body[..zlength];
    let checksum = crc32c::crc32c(body);
    if checksum != header.base().data_checksum {
        return Err(Error::new(
            Code::BlockCompressorChecksumMismatch,
            format!(
                "block checksum mismatch: {:#x} (computed) != {:#x} (stored)",
                checksum,
                header.base().data_checksum
            ),
        ));
    }
    Ok(body)
}

fn check_length(output: &BytesMut, start: usize, expected: u32) -> Result<()> {
    let got = output.len() - start;
    if got != expected as usize {
        return Err(Error::new(
            Code::BlockCompressorInflateError,
            format!("inflated {} bytes, header says {}", got, expected),
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoneCodec;

impl BlockCompressionCodec for NoneCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn deflate(
        &mut self,
        input: &[u8],
        output: &mut BytesMut,
        header: &mut dyn BlockHeaderEncoding,
        reserve: usize,
    ) -> Result<()> {
        stamp(input.len(), input, CompressionType::None, output, header, reserve);
        Ok(())
    }

    fn inflate(
        &mut self,
        input: &[u8],
        output: &mut BytesMut,
        header: &mut dyn BlockHeaderEncoding,
    ) -> Result<()> {
        let body = verified_body(input, header)?;
        let start = output.len();
        output.extend_from_slice(body);
        check_length(output, start, header.base().data_length)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec {
    level: Compression,
}

impl ZlibCodec {
    pub fn new(level: u32) -> ZlibCodec {
        ZlibCodec {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for ZlibCodec {
    fn default() -> ZlibCodec {
        ZlibCodec {
            level: Compression::default(),
        }
    }
}

impl BlockCompressionCodec for ZlibCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zlib
    }

    fn deflate(
        &mut self,
        input: &[u8],
        output: &mut BytesMut,
        header: &mut dyn BlockHeaderEncoding,
        reserve: usize,
    ) -> Result<()> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder
            .write_all(input)
            .map_err(|e| Error::new(Code::BlockCompressorDeflateError, e.to_string()))?;
        let zdata = encoder
            .finish()
            .map_err(|e| Error::new(Code::BlockCompressorDeflateError, e.to_string()))?;

        // Incompressible input is stored as-is.
        if zdata.len() >= input.len() {
            stamp(input.len(), input, CompressionType::None, output, header, reserve);
        } else {
            stamp(input.len(), &zdata, CompressionType::Zlib, output, header, reserve);
        }
        Ok(())
    }

    fn inflate(
        &mut self,
        input: &[u8],
        output: &mut BytesMut,
        header: &mut dyn BlockHeaderEncoding,
    ) -> Result<()> {
        let body = verified_body(input, header)?;
        let start = output.len();
        match header.base().compression_type {
            CompressionType::None => output.extend_from_slice(body),
            CompressionType::Zlib => {
                let mut inflated = Vec::with_capacity(header.base().data_length as usize);
                ZlibDecoder::new(body)
                    .read_to_end(&mut inflated)
                    .map_err(|e| Error::new(Code::BlockCompressorInflateError, e.to_string()))?;
                output.extend_from_slice(&inflated);
            }
            other => {
                return Err(Error::new(
                    Code::BlockCompressorUnsupportedType,
                    format!("zlib codec cannot inflate '{}' blocks", other.name()),
                ))
            }
        }
        check_length(output, start, header.base().data_length)
    }
}
