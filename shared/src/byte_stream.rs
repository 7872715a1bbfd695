use thiserror::Error;

use crate::pack;

/// Baseline backing-buffer capacity. `clear` shrinks an overgrown stream
/// back to this, bounding long-term memory held by one oversized message.
pub const STREAM_BUFFER_MAX: usize = 1460 * 4;

/// Errors that can occur while reading from a ByteStream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A read reached past the written length. Always a framing or
    /// protocol bug, never a recoverable condition.
    #[error("buffer underrun: read of {needed} bytes at position {pos}, {available} available")]
    Underrun {
        pos: usize,
        needed: usize,
        available: usize,
    },
}

/// Growable binary buffer with independent read/write cursors.
///
/// All scalars are little-endian on the wire. Three string-ish shapes are
/// used by the protocol: NUL-terminated single-byte strings, u32
/// length-prefixed UTF-8 strings and u32 length-prefixed raw blobs.
#[derive(Clone, Debug)]
pub struct ByteStream {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! read_scalar {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, StreamError> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes = self.read_exact::<N>()?;
            Ok(<$ty>::from_le_bytes(bytes))
        }
    };
}

macro_rules! write_scalar {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, v: $ty) {
            self.append(&v.to_le_bytes());
        }
    };
}

impl ByteStream {
    pub fn new() -> Self {
        Self::with_size(STREAM_BUFFER_MAX)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            rpos: 0,
            wpos: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut s = Self::with_size(bytes.len().max(STREAM_BUFFER_MAX));
        s.append(bytes);
        s
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rpos(&self) -> usize {
        self.rpos
    }

    pub fn set_rpos(&mut self, pos: usize) {
        self.rpos = pos;
    }

    pub fn wpos(&self) -> usize {
        self.wpos
    }

    pub fn set_wpos(&mut self, pos: usize) {
        self.wpos = pos;
    }

    /// Unread byte count.
    pub fn length(&self) -> usize {
        self.wpos.saturating_sub(self.rpos)
    }

    /// Allocated backing size.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Free capacity past the write cursor.
    pub fn space(&self) -> usize {
        self.data.len().saturating_sub(self.wpos)
    }

    /// The bytes written so far, readable or already consumed.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.wpos]
    }

    /// The unread bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.rpos..self.wpos]
    }

    /// Marks everything read.
    pub fn done(&mut self) {
        self.rpos = self.wpos;
    }

    /// Resets both cursors. Shrinks an overgrown backing buffer back to
    /// the baseline capacity.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
        if self.data.len() > STREAM_BUFFER_MAX {
            self.data.truncate(STREAM_BUFFER_MAX);
            self.data.shrink_to_fit();
        }
    }

    // Writing

    pub fn append(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let end = self.wpos + src.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[self.wpos..end].copy_from_slice(src);
        self.wpos = end;
    }

    write_scalar!(write_u8, u8);
    write_scalar!(write_i8, i8);
    write_scalar!(write_u16, u16);
    write_scalar!(write_i16, i16);
    write_scalar!(write_u32, u32);
    write_scalar!(write_i32, i32);
    write_scalar!(write_u64, u64);
    write_scalar!(write_i64, i64);
    write_scalar!(write_f32, f32);
    write_scalar!(write_f64, f64);

    /// Overwrites two bytes at an absolute position, leaving both cursors
    /// alone. Back-fills length fields that were reserved earlier.
    pub fn patch_u16(&mut self, pos: usize, v: u16) {
        self.data[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// NUL-terminated single-byte string.
    pub fn write_string(&mut self, v: &str) {
        self.append(v.as_bytes());
        self.write_u8(0);
    }

    /// u32 length prefix + UTF-8 bytes.
    pub fn write_utf8(&mut self, v: &str) {
        self.write_blob(v.as_bytes());
    }

    /// u32 length prefix + raw bytes.
    pub fn write_blob(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.append(v);
    }

    pub fn write_pack_xz(&mut self, x: f32, z: f32) {
        let bytes = pack::pack_xz(x, z);
        self.append(&bytes);
    }

    pub fn write_pack_y(&mut self, y: f32) {
        self.write_u16(pack::pack_y(y));
    }

    pub fn write_pack_xyz(&mut self, x: f32, y: f32, z: f32, minf: f32) {
        self.write_u32(pack::pack_xyz(x, y, z, minf));
    }

    // Reading

    fn read_exact<const N: usize>(&mut self) -> Result<[u8; N], StreamError> {
        if self.rpos + N > self.wpos {
            return Err(StreamError::Underrun {
                pos: self.rpos,
                needed: N,
                available: self.length(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.rpos..self.rpos + N]);
        self.rpos += N;
        Ok(out)
    }

    read_scalar!(read_u8, u8);
    read_scalar!(read_i8, i8);
    read_scalar!(read_u16, u16);
    read_scalar!(read_i16, i16);
    read_scalar!(read_u32, u32);
    read_scalar!(read_i32, i32);
    read_scalar!(read_u64, u64);
    read_scalar!(read_i64, i64);
    read_scalar!(read_f32, f32);
    read_scalar!(read_f64, f64);

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, StreamError> {
        if len > self.length() {
            return Err(StreamError::Underrun {
                pos: self.rpos,
                needed: len,
                available: self.length(),
            });
        }
        let out = self.data[self.rpos..self.rpos + len].to_vec();
        self.rpos += len;
        Ok(out)
    }

    pub fn read_skip(&mut self, len: usize) -> Result<(), StreamError> {
        if len > self.length() {
            return Err(StreamError::Underrun {
                pos: self.rpos,
                needed: len,
                available: self.length(),
            });
        }
        self.rpos += len;
        Ok(())
    }

    /// Reads a NUL-terminated string. A missing terminator is an underrun.
    pub fn read_string(&mut self) -> Result<String, StreamError> {
        let start = self.rpos;
        let nul = self.data[start..self.wpos].iter().position(|b| *b == 0);
        match nul {
            Some(offset) => {
                let s = String::from_utf8_lossy(&self.data[start..start + offset]).into_owned();
                self.rpos = start + offset + 1;
                Ok(s)
            }
            None => Err(StreamError::Underrun {
                pos: self.rpos,
                needed: self.length() + 1,
                available: self.length(),
            }),
        }
    }

    /// Reads a u32 length-prefixed UTF-8 string. An empty stream or a
    /// declared length past the written end yields an empty string; the
    /// peer wrote a short field and there is nothing better to do with it.
    pub fn read_utf8(&mut self) -> Result<String, StreamError> {
        Ok(String::from_utf8_lossy(&self.read_blob()?).into_owned())
    }

    /// Reads a u32 length-prefixed blob, with the same tolerance for short
    /// fields as `read_utf8`.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, StreamError> {
        if self.length() == 0 {
            return Ok(Vec::new());
        }
        let size = self.read_u32()? as usize;
        if size > self.length() {
            return Ok(Vec::new());
        }
        self.read_bytes(size)
    }

    pub fn read_pack_xz(&mut self) -> Result<(f32, f32), StreamError> {
        let bytes = self.read_exact::<3>()?;
        Ok(pack::unpack_xz(bytes))
    }

    pub fn read_pack_y(&mut self) -> Result<f32, StreamError> {
        Ok(pack::unpack_y(self.read_u16()?))
    }

    pub fn read_pack_xyz(&mut self, minf: f32) -> Result<(f32, f32, f32), StreamError> {
        Ok(pack::unpack_xyz(self.read_u32()?, minf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut s = ByteStream::new();
        s.write_u8(0xab);
        s.write_i16(-2);
        s.write_u32(0xdead_beef);
        s.write_i64(-5_000_000_000);
        s.write_f32(1.5);
        s.write_f64(-0.25);

        assert_eq!(s.read_u8().unwrap(), 0xab);
        assert_eq!(s.read_i16().unwrap(), -2);
        assert_eq!(s.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(s.read_i64().unwrap(), -5_000_000_000);
        assert_eq!(s.read_f32().unwrap(), 1.5);
        assert_eq!(s.read_f64().unwrap(), -0.25);
        assert_eq!(s.length(), 0);
    }

    #[test]
    fn scalars_are_little_endian() {
        let mut s = ByteStream::new();
        s.write_u16(0x0102);
        s.write_u32(0x03040506);
        assert_eq!(&s.written()[..6], &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn underrun_is_an_error() {
        let mut s = ByteStream::new();
        s.write_u8(1);
        assert_eq!(s.read_u8().unwrap(), 1);
        assert!(matches!(s.read_u8(), Err(StreamError::Underrun { .. })));

        let mut s = ByteStream::new();
        s.write_u16(0xffff);
        assert!(matches!(s.read_u32(), Err(StreamError::Underrun { .. })));
    }

    #[test]
    fn string_is_nul_terminated() {
        let mut s = ByteStream::new();
        s.write_string("hello");
        s.write_string("");
        s.write_u8(7);

        assert_eq!(s.read_string().unwrap(), "hello");
        assert_eq!(s.read_string().unwrap(), "");
        assert_eq!(s.read_u8().unwrap(), 7);
    }

    #[test]
    fn unterminated_string_is_underrun() {
        let mut s = ByteStream::new();
        s.append(b"abc");
        assert!(matches!(s.read_string(), Err(StreamError::Underrun { .. })));
    }

    #[test]
    fn blob_and_utf8_round_trip() {
        let mut s = ByteStream::new();
        s.write_blob(&[1, 2, 3]);
        s.write_utf8("héllo");
        assert_eq!(s.read_blob().unwrap(), vec![1, 2, 3]);
        assert_eq!(s.read_utf8().unwrap(), "héllo");
    }

    #[test]
    fn short_blob_reads_empty() {
        // declared length larger than the remaining bytes
        let mut s = ByteStream::new();
        s.write_u32(100);
        s.write_u8(1);
        assert_eq!(s.read_blob().unwrap(), Vec::<u8>::new());

        // fully empty stream
        let mut s = ByteStream::new();
        assert_eq!(s.read_blob().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn clear_shrinks_back_to_baseline() {
        let mut s = ByteStream::new();
        let big = vec![0xaa; STREAM_BUFFER_MAX * 3];
        s.append(&big);
        assert!(s.size() > STREAM_BUFFER_MAX);

        s.clear();
        assert_eq!(s.size(), STREAM_BUFFER_MAX);
        assert_eq!(s.length(), 0);
        assert_eq!(s.space(), STREAM_BUFFER_MAX);
    }

    #[test]
    fn append_grows_buffer() {
        let mut s = ByteStream::with_size(4);
        s.append(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(s.length(), 6);
        assert_eq!(s.read_bytes(6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }
}
