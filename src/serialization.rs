// Copyright 2020 Joyent, Inc.

//! Encode/decode helpers for the little-endian wire primitives used by
//! message payloads and on-disk records.
//!
//! Encoders append to any `BufMut`; decoders consume from any `Buf` and fail
//! with `Code::SerializationInputOverrun` instead of panicking when the input
//! is short.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Code, Error, Result};

const MAX_V1B: u64 = 0x7f;
const MAX_V2B: u64 = 0x3fff;
const MAX_V3B: u64 = 0x1f_ffff;
const MAX_V4B: u64 = 0xfff_ffff;
const MAX_V5B: u64 = 0x7_ffff_ffff;
const MAX_V6B: u64 = 0x3ff_ffff_ffff;
const MAX_V7B: u64 = 0x1_ffff_ffff_ffff;
const MAX_V8B: u64 = 0xff_ffff_ffff_ffff;
const MAX_V9B: u64 = 0x7fff_ffff_ffff_ffff;

pub const MAX_LEN_VINT32: usize = 5;
pub const MAX_LEN_VINT64: usize = 10;

fn check_remaining<B: Buf>(buf: &B, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        Err(Error::new(
            Code::SerializationInputOverrun,
            format!(
                "decoding {}: need {} bytes, {} remaining",
                what,
                needed,
                buf.remaining()
            ),
        ))
    } else {
        Ok(())
    }
}

pub fn encode_bool<B: BufMut>(buf: &mut B, val: bool) {
    buf.put_u8(val as u8);
}

pub fn decode_bool<B: Buf>(buf: &mut B) -> Result<bool> {
    check_remaining(buf, 1, "bool")?;
    Ok(buf.get_u8() != 0)
}

pub fn encode_i8<B: BufMut>(buf: &mut B, val: u8) {
    buf.put_u8(val);
}

pub fn decode_i8<B: Buf>(buf: &mut B) -> Result<u8> {
    check_remaining(buf, 1, "i8")?;
    Ok(buf.get_u8())
}

pub fn encode_i16<B: BufMut>(buf: &mut B, val: u16) {
    buf.put_u16_le(val);
}

pub fn decode_i16<B: Buf>(buf: &mut B) -> Result<u16> {
    check_remaining(buf, 2, "i16")?;
    Ok(buf.get_u16_le())
}

pub fn encode_i32<B: BufMut>(buf: &mut B, val: u32) {
    buf.put_u32_le(val);
}

pub fn decode_i32<B: Buf>(buf: &mut B) -> Result<u32> {
    check_remaining(buf, 4, "i32")?;
    Ok(buf.get_u32_le())
}

pub fn encode_i64<B: BufMut>(buf: &mut B, val: u64) {
    buf.put_u64_le(val);
}

pub fn decode_i64<B: Buf>(buf: &mut B) -> Result<u64> {
    check_remaining(buf, 8, "i64")?;
    Ok(buf.get_u64_le())
}

pub fn encoded_length_vi32(val: u32) -> usize {
    encoded_length_vi64(u64::from(val))
}

pub fn encoded_length_vi64(val: u64) -> usize {
    match val {
        v if v <= MAX_V1B => 1,
        v if v <= MAX_V2B => 2,
        v if v <= MAX_V3B => 3,
        v if v <= MAX_V4B => 4,
        v if v <= MAX_V5B => 5,
        v if v <= MAX_V6B => 6,
        v if v <= MAX_V7B => 7,
        v if v <= MAX_V8B => 8,
        v if v <= MAX_V9B => 9,
        _ => 10,
    }
}

pub fn encode_vi32<B: BufMut>(buf: &mut B, val: u32) {
    encode_vi64(buf, u64::from(val))
}

pub fn encode_vi64<B: BufMut>(buf: &mut B, mut val: u64) {
    while val > MAX_V1B {
        buf.put_u8((val & 0x7f) as u8 | 0x80);
        val >>= 7;
    }
    buf.put_u8(val as u8);
}

fn decode_vint<B: Buf>(buf: &mut B, max_len: usize) -> Result<u64> {
    let mut val: u64 = 0;
    let mut shift = 0;
    for _ in 0..max_len {
        check_remaining(buf, 1, "vint")?;
        let next = buf.get_u8();
        val |= u64::from(next & 0x7f) << shift;
        if next & 0x80 == 0 {
            return Ok(val);
        }
        shift += 7;
    }
    Err(Error::new(
        Code::SerializationBadVint,
        format!("vint longer than {} bytes", max_len),
    ))
}

pub fn decode_vi32<B: Buf>(buf: &mut B) -> Result<u32> {
    let val = decode_vint(buf, MAX_LEN_VINT32)?;
    if val > u64::from(u32::max_value()) {
        return Err(Error::new(
            Code::SerializationBadVint,
            format!("vint32 value {} out of range", val),
        ));
    }
    Ok(val as u32)
}

pub fn decode_vi64<B: Buf>(buf: &mut B) -> Result<u64> {
    decode_vint(buf, MAX_LEN_VINT64)
}

/// Length of a vint-prefixed byte string.
pub fn encoded_length_bytes32(len: usize) -> usize {
    encoded_length_vi32(len as u32) + len
}

pub fn encode_bytes32<B: BufMut>(buf: &mut B, data: &[u8]) {
    encode_vi32(buf, data.len() as u32);
    buf.put_slice(data);
}

pub fn decode_bytes32<B: Buf>(buf: &mut B) -> Result<Bytes> {
    let len = decode_vi32(buf)? as usize;
    check_remaining(buf, len, "bytes32")?;
    Ok(buf.copy_to_bytes(len))
}

/// Length of a 16-bit length-prefixed, NUL-terminated string.
pub fn encoded_length_str16(s: &str) -> usize {
    2 + s.len() + 1
}

pub fn encode_str16<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn decode_str16<B: Buf>(buf: &mut B) -> Result<String> {
    let len = decode_i16(buf)? as usize;
    check_remaining(buf, len + 1, "str16")?;
    let raw = buf.copy_to_bytes(len);
    if buf.get_u8() != 0 {
        return Err(Error::new(
            Code::SerializationBadString,
            "str16 missing NUL terminator",
        ));
    }
    String::from_utf8(raw.to_vec()).map_err(|e| {
        Error::new(Code::SerializationBadString, e.to_string())
    })
}

/// Length of a vint-prefixed, NUL-terminated string.
pub fn encoded_length_vstr(s: &str) -> usize {
    encoded_length_vi32(s.len() as u32) + s.len() + 1
}

pub fn encode_vstr<B: BufMut>(buf: &mut B, s: &str) {
    encode_vi32(buf, s.len() as u32);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn decode_vstr<B: Buf>(buf: &mut B) -> Result<String> {
    let len = decode_vi32(buf)? as usize;
    check_remaining(buf, len + 1, "vstr")?;
    let raw = buf.copy_to_bytes(len);
    if buf.get_u8() != 0 {
        return Err(Error::new(
            Code::SerializationBadString,
            "vstr missing NUL terminator",
        ));
    }
    String::from_utf8(raw.to_vec()).map_err(|e| {
        Error::new(Code::SerializationBadString, e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn vint_lengths_match_encoding() {
        let samples = [
            0u64,
            1,
            MAX_V1B,
            MAX_V1B + 1,
            MAX_V2B,
            MAX_V4B + 1,
            MAX_V8B,
            u64::max_value(),
        ];
        for &val in samples.iter() {
            let mut buf = BytesMut::new();
            encode_vi64(&mut buf, val);
            assert_eq!(buf.len(), encoded_length_vi64(val), "value {}", val);
            let mut rd = buf.freeze();
            assert_eq!(decode_vi64(&mut rd).unwrap(), val);
            assert_eq!(rd.remaining(), 0);
        }
    }

    #[test]
    fn overlong_vint32_is_rejected() {
        let mut rd = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        let err = decode_vi32(&mut rd).unwrap_err();
        assert_eq!(err.code(), Code::SerializationBadVint);
    }

    #[test]
    fn short_input_is_an_overrun() {
        let mut rd = Bytes::from_static(&[0x01, 0x02]);
        let err = decode_i32(&mut rd).unwrap_err();
        assert_eq!(err.code(), Code::SerializationInputOverrun);

        let mut buf = BytesMut::new();
        encode_vi32(&mut buf, 10);
        buf.put_slice(b"abc");
        let mut rd = buf.freeze();
        let err = decode_bytes32(&mut rd).unwrap_err();
        assert_eq!(err.code(), Code::SerializationInputOverrun);
    }

    #[test]
    fn strings_are_nul_terminated() {
        let mut buf = BytesMut::new();
        encode_str16(&mut buf, "range/0");
        encode_vstr(&mut buf, "");
        assert_eq!(
            buf.len(),
            encoded_length_str16("range/0") + encoded_length_vstr("")
        );
        assert_eq!(buf[2 + 7], 0);
        let mut rd = buf.freeze();
        assert_eq!(decode_str16(&mut rd).unwrap(), "range/0");
        assert_eq!(decode_vstr(&mut rd).unwrap(), "");
    }

    #[test]
    fn fixed_width_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_i32(&mut buf, 0x0102_0304);
        encode_i16(&mut buf, 0x0506);
        assert_eq!(&buf[..], &[0x04, 0x03, 0x02, 0x01, 0x06, 0x05]);
    }
}
