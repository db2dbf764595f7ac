//! Framed compressed streams backing `.bin` column files.
//!
//! ## Frame format
//!
//! ```text
//! +------------------+--------------------+-----------+------------------+
//! |compressed_len:u32|decompressed_len:u32| crc32:u32 | lz4 block bytes  |
//! +------------------+--------------------+-----------+------------------+
//! |     4 bytes      |      4 bytes       |  4 bytes  | compressed_len   |
//! +------------------+--------------------+-----------+------------------+
//! ```
//!
//! - Header integers are big-endian; the CRC32 covers the compressed bytes
//! - A mark is the pair (offset of a frame header in the compressed file,
//!   offset within that frame's decompressed data); seeking to a mark loads
//!   the frame and skips inside it

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FRAME_HEADER_SIZE: usize = 12;

/// Writes a stream of bytes as compressed frames, tracking the offsets that
/// become marks.
pub struct CompressedWriter<W: Write> {
    out: W,
    buffer: Vec<u8>,
    /// A frame is cut once the buffer reaches this many decompressed bytes.
    max_block_size: usize,
    /// Bytes of finished frames written to `out`.
    compressed_offset: u64,
    finished: bool,
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(out: W, max_block_size: usize) -> Self {
        Self {
            out,
            buffer: Vec::new(),
            max_block_size: max_block_size.max(1),
            compressed_offset: 0,
            finished: false,
        }
    }

    /// Current position as a mark: (compressed offset of the frame that will
    /// hold the next byte, decompressed offset inside it). If the buffer has
    /// already accumulated `min_block_size` bytes, the frame is cut first so
    /// the mark lands on a frame boundary.
    pub fn mark(&mut self, min_block_size: usize) -> Result<(u64, u64)> {
        if self.buffer.len() >= min_block_size && !self.buffer.is_empty() {
            self.flush_frame()?;
        }
        Ok((self.compressed_offset, self.buffer.len() as u64))
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.max_block_size {
            self.flush_frame_prefix(self.max_block_size)?;
        }
        Ok(())
    }

    /// Flushes any buffered bytes as a final frame. Must be called before
    /// dropping the writer, or the tail of the stream is lost.
    pub fn finish(&mut self) -> Result<u64> {
        if !self.buffer.is_empty() {
            self.flush_frame()?;
        }
        self.out.flush()?;
        self.finished = true;
        Ok(self.compressed_offset)
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_offset
    }

    fn flush_frame(&mut self) -> Result<()> {
        let len = self.buffer.len();
        self.flush_frame_prefix(len)
    }

    fn flush_frame_prefix(&mut self, len: usize) -> Result<()> {
        let compressed = lz4_flex::block::compress(&self.buffer[..len]);
        self.out.write_u32::<BigEndian>(compressed.len() as u32)?;
        self.out.write_u32::<BigEndian>(len as u32)?;
        self.out.write_u32::<BigEndian>(CRC32.checksum(&compressed))?;
        self.out.write_all(&compressed)?;
        self.compressed_offset += (FRAME_HEADER_SIZE + compressed.len()) as u64;
        self.buffer.drain(..len);
        Ok(())
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        CompressedWriter::write_all(self, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write> Drop for CompressedWriter<W> {
    fn drop(&mut self) {
        if !self.finished && !self.buffer.is_empty() {
            tracing::warn!("compressed writer dropped with unflushed data, call finish()");
        }
    }
}

/// Reads a stream of compressed frames, validating each frame's checksum.
pub struct CompressedReader<R: Read + Seek> {
    input: R,
    current: Vec<u8>,
    pos: usize,
}

impl<R: Read + Seek> CompressedReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, current: Vec::new(), pos: 0 }
    }

    /// Positions the reader at a mark.
    pub fn seek_to(&mut self, compressed_offset: u64, decompressed_offset: u64) -> Result<()> {
        self.input.seek(SeekFrom::Start(compressed_offset))?;
        self.current.clear();
        self.pos = 0;
        if !self.load_frame()? {
            return Err(Error::Corruption(format!(
                "seek past end of compressed stream at offset {compressed_offset}"
            )));
        }
        if decompressed_offset as usize > self.current.len() {
            return Err(Error::Corruption(format!(
                "mark offset {decompressed_offset} beyond frame of {} bytes",
                self.current.len()
            )));
        }
        self.pos = decompressed_offset as usize;
        Ok(())
    }

    /// Loads the next frame. Returns false at a clean end of stream.
    fn load_frame(&mut self) -> Result<bool> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.input.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let mut cursor = io::Cursor::new(&header[..]);
        let compressed_len = cursor.read_u32::<BigEndian>()? as usize;
        let decompressed_len = cursor.read_u32::<BigEndian>()? as usize;
        let expected_crc = cursor.read_u32::<BigEndian>()?;

        let mut compressed = vec![0u8; compressed_len];
        self.input.read_exact(&mut compressed)?;
        if CRC32.checksum(&compressed) != expected_crc {
            return Err(Error::Corruption("compressed frame checksum mismatch".into()));
        }
        self.current = lz4_flex::block::decompress(&compressed, decompressed_len)
            .map_err(|e| Error::Corruption(format!("cannot decompress frame: {e}")))?;
        if self.current.len() != decompressed_len {
            return Err(Error::Corruption(format!(
                "frame decompressed to {} bytes, header says {decompressed_len}",
                self.current.len()
            )));
        }
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read + Seek> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.current.len() {
            let more = self
                .load_frame()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if !more {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip_small() {
        let mut out = Vec::new();
        let mut writer = CompressedWriter::new(&mut out, 1024);
        writer.write_all(b"the quick brown fox").unwrap();
        writer.finish().unwrap();
        drop(writer);

        let mut reader = CompressedReader::new(Cursor::new(out));
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"the quick brown fox");
    }

    #[test]
    fn test_roundtrip_multiple_frames() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let mut writer = CompressedWriter::new(&mut out, 4096);
        writer.write_all(&data).unwrap();
        writer.finish().unwrap();
        drop(writer);

        let mut reader = CompressedReader::new(Cursor::new(out));
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_seek_to_mark() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
        let mut out = Vec::new();
        let mut writer = CompressedWriter::new(&mut out, 4096);

        // Record a mark mid-stream, then keep writing.
        writer.write_all(&data[..10_000]).unwrap();
        let mark = writer.mark(0).unwrap();
        writer.write_all(&data[10_000..]).unwrap();
        writer.finish().unwrap();
        drop(writer);

        let mut reader = CompressedReader::new(Cursor::new(out));
        reader.seek_to(mark.0, mark.1).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, &data[10_000..]);
    }

    #[test]
    fn test_corrupt_frame_detected() {
        let mut out = Vec::new();
        let mut writer = CompressedWriter::new(&mut out, 1024);
        writer.write_all(b"some payload worth protecting").unwrap();
        writer.finish().unwrap();
        drop(writer);

        // Flip a byte inside the compressed payload.
        let last = out.len() - 1;
        out[last] ^= 0xff;

        let mut reader = CompressedReader::new(Cursor::new(out));
        let mut buf = Vec::new();
        assert!(reader.read_to_end(&mut buf).is_err());
    }
}
