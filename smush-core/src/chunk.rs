// SMUSH CHUNK READER - tagged, length-prefixed container walker
//
// SMUSH files are one big "ANIM" chunk holding an AHDR header and a run of
// FRME chunks, each of which nests typed sub-chunks. Chunk headers are a
// 4-byte tag plus a big-endian u32 size; odd sizes carry one pad byte.
// Payload fields are little-endian unless stated otherwise.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

// ============================================================================
// Tags
// ============================================================================

/// Four-character chunk type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const ANIM: Tag = Tag(*b"ANIM");
    pub const AHDR: Tag = Tag(*b"AHDR");
    pub const FRME: Tag = Tag(*b"FRME");

    // Frame sub-chunks
    pub const FOBJ: Tag = Tag(*b"FOBJ");
    pub const ZFOB: Tag = Tag(*b"ZFOB");
    pub const NPAL: Tag = Tag(*b"NPAL");
    pub const XPAL: Tag = Tag(*b"XPAL");
    pub const PSAD: Tag = Tag(*b"PSAD");
    pub const IACT: Tag = Tag(*b"IACT");
    pub const TRES: Tag = Tag(*b"TRES");
    pub const TEXT: Tag = Tag(*b"TEXT");
    pub const STOR: Tag = Tag(*b"STOR");
    pub const FTCH: Tag = Tag(*b"FTCH");
    pub const SKIP: Tag = Tag(*b"SKIP");

    // SAUD audio tree
    pub const SAUD: Tag = Tag(*b"SAUD");
    pub const STRK: Tag = Tag(*b"STRK");
    pub const SMRK: Tag = Tag(*b"SMRK");
    pub const SHDR: Tag = Tag(*b"SHDR");
    pub const SDAT: Tag = Tag(*b"SDAT");

    // iMUS audio tree
    pub const IMUS: Tag = Tag(*b"iMUS");
    pub const MAP: Tag = Tag(*b"MAP ");
    pub const FRMT: Tag = Tag(*b"FRMT");
    pub const REGN: Tag = Tag(*b"REGN");
    pub const STOP: Tag = Tag(*b"STOP");
    pub const DATA: Tag = Tag(*b"DATA");

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Tag(raw))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag(\"{}\")", self)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Unexpected end of data at offset {offset:#x}")]
    Truncated { offset: u64 },
    #[error("Chunk {tag} at offset {offset:#x} declares {size} bytes but its parent only has {available} left")]
    Oversized {
        tag: Tag,
        offset: u64,
        size: u32,
        available: u64,
    },
    #[error("Unknown chunk {tag} at offset {offset:#x}")]
    UnknownTag { tag: Tag, offset: u64 },
    #[error("Chunk {tag} at offset {offset:#x} is too short ({size} bytes, need {needed})")]
    TooShort {
        tag: Tag,
        offset: u64,
        size: usize,
        needed: usize,
    },
    #[error("Seek to {target:#x} is outside the {span}-byte span")]
    SeekOutOfRange { target: u64, span: u64 },
    #[error("Not a SMUSH container (found {tag})")]
    NotSmush { tag: Tag },
}

// ============================================================================
// Chunk
// ============================================================================

/// A view of one chunk inside the container buffer.
#[derive(Clone)]
pub struct Chunk {
    pub tag: Tag,
    /// Absolute offset of the chunk header.
    pub offset: u64,
    pub payload: Bytes,
}

impl Chunk {
    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Bytes this chunk occupies in its parent, header and padding included.
    pub fn span(&self) -> u64 {
        let size = self.payload.len() as u64;
        8 + size + (size & 1)
    }

    pub fn data_offset(&self) -> u64 {
        self.offset + 8
    }

    /// Reader over the sub-chunks nested in this chunk's payload.
    pub fn children(&self) -> ChunkReader {
        ChunkReader::new(self.payload.clone(), self.data_offset())
    }

    pub fn fields(&self) -> FieldReader<'_> {
        FieldReader::new(&self.payload, self.data_offset())
    }

    pub fn require(&self, needed: usize) -> Result<(), ChunkError> {
        if self.payload.len() < needed {
            return Err(ChunkError::TooShort {
                tag: self.tag,
                offset: self.offset,
                size: self.payload.len(),
                needed,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("tag", &self.tag)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// Chunk Reader
// ============================================================================

/// Cursor over the sub-chunks of one parent span.
///
/// `consumed` marks the end of the last chunk handed out by
/// [`next_subchunk`](Self::next_subchunk); tentative scans move only the
/// cursor, so [`reseek`](Self::reseek) can return to it.
#[derive(Clone)]
pub struct ChunkReader {
    data: Bytes,
    base: u64,
    pos: usize,
    consumed: usize,
}

impl ChunkReader {
    pub fn new(data: Bytes, base: u64) -> Self {
        Self {
            data,
            base,
            pos: 0,
            consumed: 0,
        }
    }

    /// Cursor position relative to the start of the span.
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Absolute offset of the first byte of the span.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn next_subchunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        match self.read_at(self.pos)? {
            Some((chunk, next)) => {
                self.pos = next;
                self.consumed = next;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Tag of the next chunk without consuming it.
    pub fn peek_tag(&self) -> Option<Tag> {
        self.data.get(self.pos..).and_then(Tag::from_slice)
    }

    /// Moves the cursor back to right after the last fully read chunk.
    pub fn reseek(&mut self) {
        self.pos = self.consumed;
    }

    /// Restarts at the first sub-chunk.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.consumed = 0;
    }

    pub fn seek_absolute(&mut self, offset: u64) -> Result<(), ChunkError> {
        if offset > self.data.len() as u64 {
            return Err(ChunkError::SeekOutOfRange {
                target: offset,
                span: self.data.len() as u64,
            });
        }
        self.pos = offset as usize;
        self.consumed = self.pos;
        Ok(())
    }

    /// Skips chunks of any tag until one tagged `tag` is found.
    ///
    /// When the span ends without a match the last-read mark is left alone,
    /// so `reseek()` returns to where the scan started.
    pub fn scan_for(&mut self, tag: Tag) -> Result<Option<Chunk>, ChunkError> {
        while let Some((chunk, next)) = self.read_at(self.pos)? {
            self.pos = next;
            if chunk.tag == tag {
                self.consumed = next;
                return Ok(Some(chunk));
            }
            tracing::debug!("Scan for {} skipped {} at {:#x}", tag, chunk.tag, chunk.offset);
        }
        Ok(None)
    }

    fn read_at(&self, pos: usize) -> Result<Option<(Chunk, usize)>, ChunkError> {
        if pos >= self.data.len() {
            return Ok(None);
        }

        let offset = self.base + pos as u64;
        let remaining = self.data.len() - pos;
        if remaining < 8 {
            return Err(ChunkError::Truncated { offset });
        }

        let header = &self.data[pos..pos + 8];
        let tag = Tag([header[0], header[1], header[2], header[3]]);
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let available = (remaining - 8) as u64;
        if u64::from(size) > available {
            return Err(ChunkError::Oversized {
                tag,
                offset,
                size,
                available,
            });
        }

        let start = pos + 8;
        let end = start + size as usize;
        let payload = self.data.slice(start..end);

        // Word alignment; a missing final pad byte is tolerated
        let mut next = end;
        if size % 2 == 1 && next < self.data.len() {
            next += 1;
        }

        Ok(Some((Chunk { tag, offset, payload }, next)))
    }
}

// ============================================================================
// Field Reader
// ============================================================================

/// Bounds-checked scalar reads over a chunk payload.
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8], base: u64) -> Self {
        Self { data, pos: 0, base }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.remaining() < n {
            return Err(ChunkError::Truncated {
                offset: self.base + self.data.len() as u64,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ChunkError> {
        self.bytes(n).map(|_| ())
    }

    /// Everything left in the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        out
    }

    pub fn u8(&mut self) -> Result<u8, ChunkError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, ChunkError> {
        Ok(self.u8()? as i8)
    }

    pub fn u16_le(&mut self) -> Result<u16, ChunkError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16_le(&mut self) -> Result<i16, ChunkError> {
        Ok(self.u16_le()? as i16)
    }

    pub fn u32_le(&mut self) -> Result<u32, ChunkError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32_be(&mut self) -> Result<u32, ChunkError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ============================================================================
// Container Stream
// ============================================================================

/// The top level of a SMUSH file: the payload of its outer ANIM chunk.
///
/// Offsets taken and returned here are relative to the ANIM payload, which is
/// how game scripts store loop points.
pub struct SmushStream {
    reader: ChunkReader,
}

impl SmushStream {
    pub fn open(data: Bytes) -> Result<Self, ChunkError> {
        if data.len() < 8 {
            return Err(ChunkError::Truncated { offset: 0 });
        }
        let tag = Tag([data[0], data[1], data[2], data[3]]);
        if tag != Tag::ANIM {
            return Err(ChunkError::NotSmush { tag });
        }

        let declared = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let available = data.len() - 8;
        if declared > available {
            // Several shipped files overstate the ANIM size
            tracing::warn!(
                "ANIM declares {} bytes but only {} are present, clamping",
                declared,
                available
            );
        }
        let end = 8 + declared.min(available);

        Ok(Self {
            reader: ChunkReader::new(data.slice(8..end), 8),
        })
    }

    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        self.reader.next_subchunk()
    }

    pub fn seek_absolute(&mut self, offset: u64) -> Result<(), ChunkError> {
        self.reader.seek_absolute(offset)
    }

    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    pub fn body_len(&self) -> u64 {
        self.reader.len()
    }

    pub fn is_at_end(&self) -> bool {
        self.reader.is_at_end()
    }

    pub fn reader(&mut self) -> &mut ChunkReader {
        &mut self.reader
    }
}

// ============================================================================
// Animation Header
// ============================================================================

pub const AHDR_MIN_SIZE: usize = 0x306;

#[derive(Clone)]
pub struct AnimHeader {
    pub version: u16,
    pub frame_count: u16,
    pub palette: [u8; 768],
}

impl AnimHeader {
    pub fn parse(chunk: &Chunk) -> Result<Self, ChunkError> {
        chunk.require(AHDR_MIN_SIZE)?;
        let mut f = chunk.fields();
        let version = f.u16_le()?;
        let frame_count = f.u16_le()?;
        f.skip(2)?;
        let mut palette = [0u8; 768];
        palette.copy_from_slice(f.bytes(768)?);
        Ok(Self {
            version,
            frame_count,
            palette,
        })
    }
}

impl fmt::Debug for AnimHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimHeader")
            .field("version", &self.version)
            .field("frame_count", &self.frame_count)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
