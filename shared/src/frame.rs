use std::mem;

use crate::byte_stream::ByteStream;
use crate::catalog::{MessageCatalog, MessageId};

// A u16 length of 0xffff means the real length follows as a u32.
const MSG_LEN_EXT_MARKER: u16 = u16::MAX;

/// One complete inbound message, cut out of the byte stream.
#[derive(Debug)]
pub struct Frame {
    pub id: MessageId,
    pub body: ByteStream,
}

/// Receives completed frames from a [`FrameDecoder`].
pub trait FrameSink {
    fn on_frame(&mut self, frame: Frame);
}

impl FrameSink for Vec<Frame> {
    fn on_frame(&mut self, frame: Frame) {
        self.push(frame);
    }
}

/// Outcome of one decode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeProgress {
    /// Every byte handed in was consumed.
    Consumed,
    /// Decoding stopped at a message id the catalog cannot frame yet.
    /// `used` bytes of this pass were consumed; the caller keeps the rest
    /// and retries them on a later pass. The id is usually declared by a
    /// protocol import sitting in the frames decoded so far, which the
    /// session applies before the next pass.
    Stalled { id: MessageId, used: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    MsgId,
    MsgLen,
    MsgLenEx,
    Body,
}

/// Incremental frame decoder.
///
/// Feed it raw bytes as they arrive from the transport in any fragmentation;
/// it cuts them into complete frames and hands each to the sink. The frame
/// layout is `[u16 id][u16 len?][u32 ext len?][body]` where messages declared
/// with a fixed length carry no length field at all and a u16 length of
/// `0xffff` escapes to the u32 extended form.
pub struct FrameDecoder {
    state: ReadState,
    expect: usize,
    scratch: [u8; 4],
    scratch_len: usize,
    msg_id: MessageId,
    body: ByteStream,
    stalled: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: ReadState::MsgId,
            expect: 2,
            scratch: [0; 4],
            scratch_len: 0,
            msg_id: 0,
            body: ByteStream::new(),
            stalled: false,
        }
    }

    /// Back to expecting a message id. Used when a connection is torn down
    /// and the decoder is reused for the next one.
    pub fn reset(&mut self) {
        self.state = ReadState::MsgId;
        self.expect = 2;
        self.scratch_len = 0;
        self.msg_id = 0;
        self.body.clear();
        self.stalled = false;
    }

    /// True while the decoder holds a message id it could not frame.
    /// Callers must keep retrying `process` even with no new bytes; the
    /// held message may be bodyless.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Consumes `data`, emitting every frame completed by it. Partial
    /// headers and bodies are buffered across calls, so the split points
    /// of the incoming byte stream never affect the emitted frames.
    pub fn process(
        &mut self,
        data: &[u8],
        catalog: &MessageCatalog,
        sink: &mut dyn FrameSink,
    ) -> DecodeProgress {
        if self.stalled {
            let length = match catalog.client_message(self.msg_id) {
                Some(msg) => msg.length,
                None => {
                    return DecodeProgress::Stalled {
                        id: self.msg_id,
                        used: 0,
                    }
                }
            };
            self.stalled = false;
            self.begin_body(length, sink);
        }

        let mut data = data;
        let mut used = 0usize;

        while !data.is_empty() {
            let take = self.expect.min(data.len());
            let (chunk, rest) = data.split_at(take);

            match self.state {
                ReadState::Body => self.body.append(chunk),
                _ => {
                    self.scratch[self.scratch_len..self.scratch_len + take]
                        .copy_from_slice(chunk);
                    self.scratch_len += take;
                }
            }

            self.expect -= take;
            data = rest;
            used += take;

            if self.expect > 0 {
                break;
            }

            match self.state {
                ReadState::MsgId => {
                    self.msg_id = u16::from_le_bytes([self.scratch[0], self.scratch[1]]);
                    self.scratch_len = 0;

                    match catalog.client_message(self.msg_id) {
                        Some(msg) => {
                            let length = msg.length;
                            self.begin_body(length, sink);
                        }
                        None => {
                            self.stalled = true;
                            return DecodeProgress::Stalled {
                                id: self.msg_id,
                                used,
                            };
                        }
                    }
                }
                ReadState::MsgLen => {
                    let len = u16::from_le_bytes([self.scratch[0], self.scratch[1]]);
                    self.scratch_len = 0;

                    if len == MSG_LEN_EXT_MARKER {
                        self.state = ReadState::MsgLenEx;
                        self.expect = 4;
                    } else if len == 0 {
                        // empty body, nothing more to wait for
                        self.emit(sink);
                    } else {
                        self.state = ReadState::Body;
                        self.expect = len as usize;
                    }
                }
                ReadState::MsgLenEx => {
                    let len = u32::from_le_bytes(self.scratch);
                    self.scratch_len = 0;

                    if len == 0 {
                        self.emit(sink);
                    } else {
                        self.state = ReadState::Body;
                        self.expect = len as usize;
                    }
                }
                ReadState::Body => {
                    self.emit(sink);
                }
            }
        }

        DecodeProgress::Consumed
    }

    fn begin_body(&mut self, length: i16, sink: &mut dyn FrameSink) {
        if length == -1 {
            self.state = ReadState::MsgLen;
            self.expect = 2;
        } else if length == 0 {
            self.emit(sink);
        } else {
            self.state = ReadState::Body;
            self.expect = length as usize;
        }
    }

    fn emit(&mut self, sink: &mut dyn FrameSink) {
        let body = mem::take(&mut self.body);
        sink.on_frame(Frame {
            id: self.msg_id,
            body,
        });
        self.state = ReadState::MsgId;
        self.expect = 2;
    }
}
