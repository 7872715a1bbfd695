use std::mem;

use log::error;
use thiserror::Error;

use crate::byte_stream::ByteStream;
use crate::catalog::{MessageDescriptor, MessageId};

/// An error produced when handing a segment to the transport fails.
#[derive(Debug, Error)]
#[error("the transport refused the segment")]
pub struct SendError;

/// Receives the sealed wire segments of a [`Bundle`], in order.
pub trait SegmentSink {
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError>;
}

/// Outbound message builder.
///
/// `start_message` writes the header for one message, the `write_*` calls
/// append its arguments and `send` seals everything and hands the segments
/// to the sink. Each message starts at offset zero of a fresh segment and
/// may spill across several when its body outgrows one; the u16 length
/// field of a variable-length message is back-patched into the segment
/// holding its header.
pub struct Bundle {
    stream: ByteStream,
    segments: Vec<ByteStream>,
    message_count: u32,
    message_length: usize,
    msg_id: MessageId,
    msg_variable: bool,
    spill_count: usize,
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

impl Bundle {
    pub fn new() -> Self {
        Self {
            stream: ByteStream::new(),
            segments: Vec::new(),
            message_count: 0,
            message_length: 0,
            msg_id: 0,
            msg_variable: false,
            spill_count: 0,
        }
    }

    /// Seals the previous message (if any) and opens a new one.
    pub fn start_message(&mut self, msg: &MessageDescriptor) {
        self.finish(false);

        self.msg_id = msg.id;
        self.msg_variable = msg.length == -1;
        self.message_count += 1;

        self.write_u16(msg.id);
        if self.msg_variable {
            // length placeholder, patched when the message is sealed
            self.write_u16(0);
            self.message_length = 0;
        }

        self.spill_count = 0;
    }

    fn finish(&mut self, sending: bool) {
        if self.message_count > 0 {
            self.patch_msg_length();
            let sealed = mem::replace(&mut self.stream, ByteStream::new());
            self.segments.push(sealed);
        }

        if sending {
            self.message_count = 0;
        }

        self.spill_count = 0;
    }

    fn patch_msg_length(&mut self) {
        if !self.msg_variable {
            return;
        }

        if self.message_length > u16::MAX as usize {
            error!(
                "Bundle::patch_msg_length: message({}) length {} overflows the u16 length field!",
                self.msg_id, self.message_length
            );
        }

        // The header segment: the current stream, or the first of the
        // segments this message spilled across.
        let target = if self.spill_count > 0 {
            let index = self.segments.len() - self.spill_count;
            &mut self.segments[index]
        } else {
            &mut self.stream
        };
        target.patch_u16(2, self.message_length as u16);
    }

    fn check_stream(&mut self, len: usize) {
        if len > self.stream.space() {
            let sealed = mem::replace(&mut self.stream, ByteStream::new());
            self.segments.push(sealed);
            self.spill_count += 1;
        }

        self.message_length += len;
    }

    /// Seals the bundle and hands every segment to the sink. The bundle is
    /// reusable afterwards whether or not the sink accepted them all.
    pub fn send(&mut self, sink: &mut dyn SegmentSink) -> Result<(), SendError> {
        self.finish(true);

        let mut result = Ok(());
        for segment in &self.segments {
            if result.is_ok() {
                result = sink.send_segment(segment.remaining());
            }
        }

        self.segments.clear();
        self.stream.clear();
        result
    }

    pub fn write_i8(&mut self, v: i8) {
        self.check_stream(1);
        self.stream.write_i8(v);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.check_stream(1);
        self.stream.write_u8(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.check_stream(2);
        self.stream.write_i16(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.check_stream(2);
        self.stream.write_u16(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.check_stream(4);
        self.stream.write_i32(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.check_stream(4);
        self.stream.write_u32(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.check_stream(8);
        self.stream.write_i64(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.check_stream(8);
        self.stream.write_u64(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.check_stream(4);
        self.stream.write_f32(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.check_stream(8);
        self.stream.write_f64(v);
    }

    pub fn write_string(&mut self, v: &str) {
        self.check_stream(v.len() + 1);
        self.stream.write_string(v);
    }

    pub fn write_utf8(&mut self, v: &str) {
        self.check_stream(v.len() + 4);
        self.stream.write_utf8(v);
    }

    pub fn write_blob(&mut self, v: &[u8]) {
        self.check_stream(v.len() + 4);
        self.stream.write_blob(v);
    }
}
