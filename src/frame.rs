// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The framed byte buffer (C1): a writable builder that accumulates
//! primitives into a growable region with the first four bytes reserved
//! for the final little-endian length, a reader that pulls the same
//! primitives back out of a completed frame, and a reassembler that
//! turns a stream of arbitrary byte slices into a sequence of complete
//! frame payloads.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{GatewayError, Result};

const LENGTH_PREFIX_SIZE: usize = 4;
const INITIAL_CAPACITY: usize = 64;

/// Accumulates primitives into a growable buffer. The first four bytes
/// are reserved for the frame length and are patched in by [`finish`].
///
/// [`finish`]: FrameWriter::finish
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> FrameWriter {
        let mut buf = Vec::with_capacity(INITIAL_CAPACITY);
        buf.extend_from_slice(&[0u8; LENGTH_PREFIX_SIZE]);
        FrameWriter { buf }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 0x01 } else { 0x00 });
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i32(&mut self, v: i32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_i32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_i64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_f64(&mut self, v: f64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_f64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    /// Overwrites the subscription-id field of an already-serialized
    /// frame in place. The layout is fixed: 4-byte length prefix, 1-byte
    /// action tag, then the 4-byte subscription id, used by write
    /// coalescing to retarget a shared payload to each destination's
    /// subscription id without re-serializing the whole frame.
    pub(crate) fn overwrite_subscription_id_slot(buf: &mut [u8], subscription_id: u32) {
        const SUBSCRIPTION_ID_OFFSET: usize = 4 + 1;
        LittleEndian::write_u32(
            &mut buf[SUBSCRIPTION_ID_OFFSET..SUBSCRIPTION_ID_OFFSET + 4],
            subscription_id,
        );
    }

    /// Patches the length prefix and returns the completed frame, ready
    /// to hand to the socket.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        LittleEndian::write_u32(&mut self.buf[0..4], len);
        self.buf
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        FrameWriter::new()
    }
}

/// Reads primitives back out of a byte slice in the same order
/// [`FrameWriter`] wrote them. Used both over a frame's payload (after
/// the reassembler has stripped the length prefix) and over the bytes
/// nested inside a Message field of type `Message`.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> FrameReader<'a> {
        FrameReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(GatewayError::ProtocolViolation(format!(
                "short read: wanted {} bytes at offset {}, frame has {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(GatewayError::ProtocolViolation(format!(
                "invalid bool byte {other}"
            ))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_blob()?;
        // The wire format treats strings as opaque byte sequences (spec
        // §4.1); we accept non-UTF8 by lossily converting rather than
        // failing the frame, since subjects and labels are not required
        // to be valid UTF-8 on the wire.
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Reassembles one frame from successive byte slices delivered off a
/// bytestream. Once [`has_complete_frame`] is true, call [`take_payload`]
/// to retrieve the frame payload (the header+body bytes, i.e. everything
/// after the four-byte length prefix) and start a fresh `FrameAssembler`
/// for the next frame.
///
/// [`has_complete_frame`]: FrameAssembler::has_complete_frame
/// [`take_payload`]: FrameAssembler::take_payload
pub struct FrameAssembler {
    length_prefix: [u8; LENGTH_PREFIX_SIZE],
    length_prefix_filled: usize,
    total_length: Option<u32>,
    payload: Vec<u8>,
    max_frame_len: u32,
}

impl FrameAssembler {
    pub fn new(max_frame_len: u32) -> FrameAssembler {
        FrameAssembler {
            length_prefix: [0u8; LENGTH_PREFIX_SIZE],
            length_prefix_filled: 0,
            total_length: None,
            payload: Vec::new(),
            max_frame_len,
        }
    }

    /// Feeds bytes from the stream into this in-progress frame. Returns
    /// the number of bytes consumed from `data` (which may be less than
    /// `data.len()` once the frame completes) so the caller can loop on
    /// the remainder with a fresh `FrameAssembler`.
    pub fn append_from_stream(&mut self, data: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        if self.total_length.is_none() {
            while self.length_prefix_filled < LENGTH_PREFIX_SIZE && consumed < data.len() {
                self.length_prefix[self.length_prefix_filled] = data[consumed];
                self.length_prefix_filled += 1;
                consumed += 1;
            }

            if self.length_prefix_filled < LENGTH_PREFIX_SIZE {
                return Ok(consumed);
            }

            let total_length = LittleEndian::read_u32(&self.length_prefix);
            if total_length < LENGTH_PREFIX_SIZE as u32 {
                return Err(GatewayError::ProtocolViolation(format!(
                    "frame length {total_length} smaller than the length prefix itself"
                )));
            }
            if total_length > self.max_frame_len {
                return Err(GatewayError::ResourceExhaustion(format!(
                    "frame length {total_length} exceeds maximum {}",
                    self.max_frame_len
                )));
            }

            self.total_length = Some(total_length);
            self.payload = Vec::with_capacity(total_length as usize - LENGTH_PREFIX_SIZE);
        }

        let payload_len = self.total_length.unwrap() as usize - LENGTH_PREFIX_SIZE;
        let remaining_for_payload = payload_len - self.payload.len();
        let take = remaining_for_payload.min(data.len() - consumed);

        self.payload.extend_from_slice(&data[consumed..consumed + take]);
        consumed += take;

        Ok(consumed)
    }

    pub fn has_complete_frame(&self) -> bool {
        match self.total_length {
            Some(total) => self.payload.len() == total as usize - LENGTH_PREFIX_SIZE,
            None => false,
        }
    }

    pub fn take_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_frame_is_accepted() {
        let w = FrameWriter::new();
        let frame = w.finish();
        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE);
        assert_eq!(LittleEndian::read_u32(&frame), LENGTH_PREFIX_SIZE as u32);
    }

    #[test]
    fn reassembles_regardless_of_chunking() {
        let mut w = FrameWriter::new();
        w.write_u32(0xDEADBEEF);
        w.write_string("orders.new");
        let frame = w.finish();

        for chunk_size in 1..=frame.len() {
            let mut assembler = FrameAssembler::new(1 << 20);
            let mut consumed_total = 0;
            for chunk in frame.chunks(chunk_size) {
                let mut offset = 0;
                while offset < chunk.len() {
                    let consumed = assembler.append_from_stream(&chunk[offset..]).unwrap();
                    offset += consumed;
                    consumed_total += consumed;
                    if assembler.has_complete_frame() {
                        break;
                    }
                }
                if assembler.has_complete_frame() {
                    break;
                }
            }
            assert!(assembler.has_complete_frame(), "chunk_size={chunk_size}");
            assert_eq!(consumed_total, frame.len());
            let payload = assembler.take_payload();
            assert_eq!(payload, frame[LENGTH_PREFIX_SIZE..]);
        }
    }

    #[test]
    fn split_exactly_on_length_prefix_boundary() {
        let mut w = FrameWriter::new();
        w.write_u32(42);
        let frame = w.finish();

        let mut assembler = FrameAssembler::new(1 << 20);
        let consumed = assembler.append_from_stream(&frame[..4]).unwrap();
        assert_eq!(consumed, 4);
        assert!(!assembler.has_complete_frame());

        let consumed = assembler.append_from_stream(&frame[4..]).unwrap();
        assert_eq!(consumed, frame.len() - 4);
        assert!(assembler.has_complete_frame());
    }

    #[test]
    fn short_read_is_reported() {
        let mut r = FrameReader::new(&[0x01, 0x00]);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn oversized_frame_is_resource_exhaustion() {
        let mut assembler = FrameAssembler::new(16);
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, 1000);
        let result = assembler.append_from_stream(&tmp);
        assert!(matches!(result, Err(GatewayError::ResourceExhaustion(_))));
    }
}
