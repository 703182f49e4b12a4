//! # Audio channels
//!
//! A track's audio arrives as numbered segments spread over many frames
//! (`PSAD` for SAUD tracks, `IACT` for iMUS tracks and for the interleaved
//! stream). Each channel reassembles its segments into one big-endian tagged
//! tree, walks the tree as bytes arrive and hands finished PCM to the mixer.
//!
//! ```text
//! UNINITIALIZED --set_parameters--> ACCUMULATING --end of data--> TERMINATED
//! ```

use thiserror::Error;

use crate::chunk::{ChunkError, FieldReader, Tag};

pub const SAUD_RATE: u32 = 22050;
pub const INTERLEAVED_RATE: u32 = 22050;

/// Decoded size of one interleaved block: 1024 stereo 16-bit frames.
pub const INTERLEAVED_BLOCK_OUTPUT: usize = 4096;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Track {track}: segment {got} out of order (expected {expected})")]
    IndexMismatch { track: u32, expected: u16, got: u16 },
    #[error("Track {track}: frame count changed from {expected} to {got}")]
    FrameCountMismatch { track: u32, expected: u16, got: u16 },
    #[error("Track {track}: flags changed from {expected} to {got}")]
    FlagsMismatch { track: u32, expected: u16, got: u16 },
    #[error("Track {track}: expected {expected} wrapper, found {found}")]
    BadWrapper { track: u32, expected: Tag, found: Tag },
    #[error("Track {track}: unknown sub-chunk {tag}")]
    UnknownSubTag { track: u32, tag: Tag },
    #[error("Track {track}: {tag} has invalid size {size}")]
    BadSubChunkSize { track: u32, tag: Tag, size: u32 },
    #[error("Track {track}: sample data before format")]
    MissingFormat { track: u32 },
    #[error("Track {track}: unsupported sample size of {bits} bits")]
    UnsupportedBits { track: u32, bits: u32 },
    #[error("Bad IACT track flags {0}")]
    BadTrackFlags(u16),
    #[error("IACT audio with non-zero reserved field {0}")]
    IactReserved(i16),
    #[error("Interleaved audio block is corrupt")]
    CorruptBlock,
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

// ============================================================================
// Output formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16Be,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub rate: u32,
    pub channels: u16,
    pub sample: SampleFormat,
}

impl PcmFormat {
    pub fn bytes_per_frame(&self) -> usize {
        let width = match self.sample {
            SampleFormat::U8 => 1,
            SampleFormat::S16Be => 2,
        };
        width * self.channels.max(1) as usize
    }

    pub fn bytes_to_ms(&self, bytes: u64) -> u64 {
        let per_second = self.bytes_per_frame() as u64 * u64::from(self.rate.max(1));
        bytes * 1000 / per_second
    }
}

// ============================================================================
// Segment headers
// ============================================================================

/// `PSAD` header, followed by segment bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundSegment {
    pub track: u16,
    pub index: u16,
    pub max_frames: u16,
    pub flags: u16,
    pub volume: u8,
    pub pan: i8,
}

impl SoundSegment {
    pub fn parse(payload: &[u8], base: u64) -> Result<(Self, &[u8]), ChunkError> {
        let mut f = FieldReader::new(payload, base);
        let segment = SoundSegment {
            track: f.u16_le()?,
            index: f.u16_le()?,
            max_frames: f.u16_le()?,
            flags: f.u16_le()?,
            volume: f.u8()?,
            pan: f.i8()?,
        };
        Ok((segment, f.rest()))
    }
}

/// `IACT` header. Only `code == 8, flags == 46` carries audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IactHeader {
    pub code: u16,
    pub flags: u16,
    pub reserved: i16,
    pub track_flags: u16,
    pub track_id: u16,
    pub index: u16,
    pub frame_count: u16,
    pub size: u32,
}

impl IactHeader {
    pub const LEN: usize = 18;

    pub fn parse(payload: &[u8], base: u64) -> Result<(Self, &[u8]), ChunkError> {
        let mut f = FieldReader::new(payload, base);
        let code = f.u16_le()?;
        let flags = f.u16_le()?;
        let reserved = f.i16_le()?;
        let track_flags = f.u16_le()?;
        if !(code == 8 && flags == 46) {
            // Game-logic opcode; the rest of the layout is opcode specific
            let header = IactHeader {
                code,
                flags,
                reserved,
                track_flags,
                track_id: 0,
                index: 0,
                frame_count: 0,
                size: 0,
            };
            return Ok((header, f.rest()));
        }
        let header = IactHeader {
            code,
            flags,
            reserved,
            track_flags,
            track_id: f.u16_le()?,
            index: f.u16_le()?,
            frame_count: f.u16_le()?,
            size: f.u32_le()?,
        };
        Ok((header, f.rest()))
    }

    pub fn is_audio(&self) -> bool {
        self.code == 8 && self.flags == 46
    }

    /// Registry id of an IACT track: the track number offset by its class.
    pub fn channel_id(&self) -> Result<u32, AudioError> {
        let offset = match self.track_flags {
            1 => 100,
            2 => 200,
            3 => 300,
            100..=163 => 400,
            200..=263 => 500,
            300..=363 => 600,
            other => return Err(AudioError::BadTrackFlags(other)),
        };
        Ok(u32::from(self.track_id) + offset)
    }
}

/// Volume implied by an IACT track-flags class.
pub fn iact_volume(track_flags: u16) -> u8 {
    let v = match track_flags {
        1..=3 => 127,
        100..=163 => i32::from(track_flags) * 2 - 200,
        200..=263 => i32::from(track_flags) * 2 - 400,
        300..=363 => i32::from(track_flags) * 2 - 600,
        _ => 127,
    };
    v.clamp(0, 127) as u8
}

// ============================================================================
// Reassembly core
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    /// Whole chunk must be buffered, then handed to the tree parser.
    Header,
    /// Children follow inline.
    Container,
    /// Sample bytes follow.
    Data,
}

trait TreeParser {
    const WRAPPER: Tag;

    fn classify(&self, tag: Tag) -> Option<TagKind>;

    fn handle(&mut self, track: u32, tag: Tag, payload: &[u8]) -> Result<(), AudioError>;
}

#[derive(Debug, Default)]
struct Reassembly {
    pending: Vec<u8>,
    raw: Vec<u8>,
    wrapper_seen: bool,
    data_remaining: Option<u32>,
    data_complete: bool,
    passthrough: bool,
}

impl Reassembly {
    fn reset(&mut self, passthrough: bool) {
        *self = Reassembly {
            passthrough,
            ..Default::default()
        };
    }

    fn feed<P: TreeParser>(&mut self, parser: &mut P, track: u32, data: &[u8]) -> Result<(), AudioError> {
        if self.passthrough {
            self.raw.extend_from_slice(data);
            return Ok(());
        }
        self.pending.extend_from_slice(data);

        let mut pos = 0usize;
        let result = loop {
            if let Some(remaining) = self.data_remaining {
                let take = (remaining as usize).min(self.pending.len() - pos);
                self.raw.extend_from_slice(&self.pending[pos..pos + take]);
                pos += take;
                let left = remaining - take as u32;
                if left > 0 {
                    self.data_remaining = Some(left);
                    break Ok(());
                }
                self.data_remaining = None;
                self.data_complete = true;
                continue;
            }

            let available = self.pending.len() - pos;
            if available < 8 {
                break Ok(());
            }
            let header = &self.pending[pos..pos + 8];
            let tag = Tag([header[0], header[1], header[2], header[3]]);
            let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

            if !self.wrapper_seen {
                if tag != P::WRAPPER {
                    break Err(AudioError::BadWrapper {
                        track,
                        expected: P::WRAPPER,
                        found: tag,
                    });
                }
                self.wrapper_seen = true;
                pos += 8;
                continue;
            }

            match parser.classify(tag) {
                None => break Err(AudioError::UnknownSubTag { track, tag }),
                Some(TagKind::Container) => pos += 8,
                Some(TagKind::Data) => {
                    pos += 8;
                    self.data_remaining = Some(size);
                }
                Some(TagKind::Header) => {
                    let end = 8 + size as usize;
                    if available < end {
                        break Ok(());
                    }
                    if let Err(e) = parser.handle(track, tag, &self.pending[pos + 8..pos + end]) {
                        break Err(e);
                    }
                    pos += end;
                }
            }
        };

        self.pending.drain(..pos);
        result
    }

    /// Sample bytes still expected from the current data chunk.
    fn remaining(&self) -> usize {
        self.data_remaining.unwrap_or(0) as usize
    }
}

/// Parameters announced by a track's first segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentParams {
    pub index: u16,
    pub frame_count: u16,
    pub flags: u16,
    pub volume: u8,
    pub pan: i8,
}

fn check_segment(
    track: u32,
    params: &mut Option<SegmentParams>,
    index: u16,
    frame_count: u16,
    flags: u16,
) -> Result<(), AudioError> {
    let Some(p) = params.as_mut() else {
        return Err(AudioError::IndexMismatch {
            track,
            expected: 0,
            got: index,
        });
    };
    let expected = p.index.wrapping_add(1);
    if index != expected {
        return Err(AudioError::IndexMismatch {
            track,
            expected,
            got: index,
        });
    }
    if frame_count != p.frame_count {
        return Err(AudioError::FrameCountMismatch {
            track,
            expected: p.frame_count,
            got: frame_count,
        });
    }
    if flags != p.flags {
        return Err(AudioError::FlagsMismatch {
            track,
            expected: p.flags,
            got: flags,
        });
    }
    p.index = index;
    Ok(())
}

// ============================================================================
// SAUD
// ============================================================================

#[derive(Debug, Default)]
struct SaudTree {
    mark_reached: bool,
}

impl TreeParser for SaudTree {
    const WRAPPER: Tag = Tag::SAUD;

    fn classify(&self, tag: Tag) -> Option<TagKind> {
        match tag {
            Tag::STRK | Tag::SMRK | Tag::SHDR => Some(TagKind::Header),
            Tag::SDAT => Some(TagKind::Data),
            _ => None,
        }
    }

    fn handle(&mut self, track: u32, tag: Tag, payload: &[u8]) -> Result<(), AudioError> {
        let size = payload.len() as u32;
        match tag {
            // Track header; older files use the 10 and 14 byte forms
            Tag::STRK if !matches!(size, 10 | 14 | 0x14) => Err(AudioError::BadSubChunkSize { track, tag, size }),
            Tag::SHDR if size != 4 => Err(AudioError::BadSubChunkSize { track, tag, size }),
            Tag::SMRK => {
                self.mark_reached = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// 8-bit mono track carried in `PSAD` segments.
#[derive(Debug)]
pub struct SaudChannel {
    track: u32,
    params: Option<SegmentParams>,
    tree: SaudTree,
    buffer: Reassembly,
}

impl SaudChannel {
    pub fn new(track: u32) -> Self {
        Self {
            track,
            params: None,
            tree: SaudTree::default(),
            buffer: Reassembly::default(),
        }
    }

    fn is_terminated(&self) -> bool {
        !self.buffer.passthrough && self.tree.mark_reached && self.buffer.data_complete
    }
}

// ============================================================================
// iMUS
// ============================================================================

#[derive(Debug, Default)]
struct ImuseTree {
    bits: u32,
    rate: u32,
    channels: u32,
}

impl TreeParser for ImuseTree {
    const WRAPPER: Tag = Tag::IMUS;

    fn classify(&self, tag: Tag) -> Option<TagKind> {
        match tag {
            Tag::MAP => Some(TagKind::Container),
            Tag::FRMT | Tag::TEXT | Tag::REGN | Tag::STOP => Some(TagKind::Header),
            Tag::DATA => Some(TagKind::Data),
            _ => None,
        }
    }

    fn handle(&mut self, track: u32, tag: Tag, payload: &[u8]) -> Result<(), AudioError> {
        let size = payload.len() as u32;
        match tag {
            Tag::FRMT => {
                if size != 20 {
                    return Err(AudioError::BadSubChunkSize { track, tag, size });
                }
                let mut f = FieldReader::new(payload, 0);
                f.skip(8)?;
                self.bits = f.u32_be()?;
                self.rate = f.u32_be()?;
                self.channels = f.u32_be()?;
                if !matches!(self.bits, 8 | 12 | 16) {
                    return Err(AudioError::UnsupportedBits { track, bits: self.bits });
                }
                tracing::debug!(
                    "Track {}: {} bit, {} Hz, {} channel(s)",
                    track,
                    self.bits,
                    self.rate,
                    self.channels
                );
                Ok(())
            }
            Tag::REGN if size != 8 => Err(AudioError::BadSubChunkSize { track, tag, size }),
            Tag::STOP if size != 4 => Err(AudioError::BadSubChunkSize { track, tag, size }),
            _ => Ok(()),
        }
    }
}

/// Track carried in `IACT` segments; 12-bit packed data is widened to 16.
#[derive(Debug)]
pub struct ImuseChannel {
    track: u32,
    params: Option<SegmentParams>,
    tree: ImuseTree,
    buffer: Reassembly,
    ready: Vec<u8>,
}

impl ImuseChannel {
    pub fn new(track: u32) -> Self {
        Self {
            track,
            params: None,
            tree: ImuseTree::default(),
            buffer: Reassembly::default(),
            ready: Vec::new(),
        }
    }

    fn convert(&mut self) -> Result<(), AudioError> {
        if self.buffer.raw.is_empty() {
            return Ok(());
        }
        if self.tree.bits == 0 {
            return Err(AudioError::MissingFormat { track: self.track });
        }
        let usable = match self.tree.bits {
            12 => self.buffer.raw.len() / 3 * 3,
            16 => self.buffer.raw.len() & !1,
            _ => self.buffer.raw.len(),
        };
        if self.tree.bits == 12 {
            unpack_12bit(&self.buffer.raw[..usable], &mut self.ready);
        } else {
            self.ready.extend_from_slice(&self.buffer.raw[..usable]);
        }
        // Partial samples wait for the next segment
        self.buffer.raw.drain(..usable);
        Ok(())
    }

    fn format(&self) -> Option<PcmFormat> {
        let sample = match self.tree.bits {
            8 => SampleFormat::U8,
            12 | 16 => SampleFormat::S16Be,
            _ => return None,
        };
        Some(PcmFormat {
            rate: self.tree.rate,
            channels: self.tree.channels as u16,
            sample,
        })
    }
}

/// Expands packed 12-bit sample pairs into signed 16-bit big-endian.
pub fn unpack_12bit(src: &[u8], out: &mut Vec<u8>) {
    out.reserve(src.len() / 3 * 4);
    for triple in src.chunks_exact(3) {
        let (v1, v2, v3) = (i32::from(triple[0]), i32::from(triple[1]), i32::from(triple[2]));
        let first = ((((v2 & 0x0f) << 8) | v1) << 4) - 0x8000;
        let second = ((((v2 & 0xf0) << 4) | v3) << 4) - 0x8000;
        out.extend_from_slice(&(first as i16).to_be_bytes());
        out.extend_from_slice(&(second as i16).to_be_bytes());
    }
}

// ============================================================================
// Interleaved
// ============================================================================

/// The single compressed IACT stream of the later container revision.
#[derive(Debug, Default)]
pub struct InterleavedChannel {
    track: u32,
    block: Vec<u8>,
    ready: Vec<u8>,
    /// Joined mid-stream: corrupt blocks are dropped until one decodes
    resync: bool,
}

impl InterleavedChannel {
    pub fn new(track: u32) -> Self {
        Self {
            track,
            ..Default::default()
        }
    }

    fn append(&mut self, mut data: &[u8]) -> Result<(), AudioError> {
        while !data.is_empty() {
            if self.block.len() < 2 {
                let need = 2 - self.block.len();
                let take = need.min(data.len());
                self.block.extend_from_slice(&data[..take]);
                data = &data[take..];
                continue;
            }
            let total = u16::from_be_bytes([self.block[0], self.block[1]]) as usize + 2;
            let take = (total - self.block.len()).min(data.len());
            self.block.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.block.len() == total {
                let mark = self.ready.len();
                let decoded = decode_interleaved_block(&self.block[2..], &mut self.ready);
                self.block.clear();
                match decoded {
                    Ok(()) => self.resync = false,
                    Err(e) if self.resync => {
                        self.ready.truncate(mark);
                        tracing::warn!("Dropping {}-byte interleaved block after mid-stream join: {}", total, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// Decodes one block: a shift byte then 1024 left/right sample pairs.
pub fn decode_interleaved_block(block: &[u8], out: &mut Vec<u8>) -> Result<(), AudioError> {
    let (&shifts, mut src) = block.split_first().ok_or(AudioError::CorruptBlock)?;
    let shift = [shifts >> 4, shifts & 0x0f];

    out.reserve(INTERLEAVED_BLOCK_OUTPUT);
    for _ in 0..1024 {
        for &s in &shift {
            let (&value, rest) = src.split_first().ok_or(AudioError::CorruptBlock)?;
            src = rest;
            if value == 0x80 {
                let raw = src.get(..2).ok_or(AudioError::CorruptBlock)?;
                out.extend_from_slice(raw);
                src = &src[2..];
            } else {
                let sample = (i16::from(value as i8)).wrapping_shl(u32::from(s));
                out.extend_from_slice(&sample.to_be_bytes());
            }
        }
    }
    Ok(())
}

// ============================================================================
// Channel sum type
// ============================================================================

#[derive(Debug)]
pub enum AudioChannel {
    Saud(SaudChannel),
    Imuse(ImuseChannel),
    Interleaved(InterleavedChannel),
}

impl AudioChannel {
    pub fn saud(track: u32) -> Self {
        AudioChannel::Saud(SaudChannel::new(track))
    }

    pub fn imuse(track: u32) -> Self {
        AudioChannel::Imuse(ImuseChannel::new(track))
    }

    pub fn interleaved(track: u32) -> Self {
        AudioChannel::Interleaved(InterleavedChannel::new(track))
    }

    /// Interleaved stream entered at an arbitrary byte, not a block boundary.
    pub fn interleaved_joining(track: u32) -> Self {
        AudioChannel::Interleaved(InterleavedChannel {
            resync: true,
            ..InterleavedChannel::new(track)
        })
    }

    pub fn track(&self) -> u32 {
        match self {
            AudioChannel::Saud(c) => c.track,
            AudioChannel::Imuse(c) => c.track,
            AudioChannel::Interleaved(c) => c.track,
        }
    }

    pub fn is_initialized(&self) -> bool {
        match self {
            AudioChannel::Saud(c) => c.params.is_some(),
            AudioChannel::Imuse(c) => c.params.is_some(),
            AudioChannel::Interleaved(_) => true,
        }
    }

    /// Records the first segment's parameters. A non-zero `index` joins the
    /// track mid-stream: the tree header is gone, so bytes pass straight through.
    pub fn set_parameters(&mut self, index: u16, frame_count: u16, flags: u16, volume: u8, pan: i8) {
        let params = Some(SegmentParams {
            index,
            frame_count,
            flags,
            volume,
            pan,
        });
        match self {
            AudioChannel::Saud(c) => {
                c.params = params;
                c.tree = SaudTree::default();
                c.buffer.reset(index != 0);
            }
            AudioChannel::Imuse(c) => {
                c.params = params;
                c.tree = ImuseTree::default();
                c.buffer.reset(false);
                c.ready.clear();
            }
            AudioChannel::Interleaved(_) => {}
        }
    }

    /// Validates a follow-up segment and takes its volume and pan.
    pub fn check_parameters(
        &mut self,
        index: u16,
        frame_count: u16,
        flags: u16,
        volume: u8,
        pan: i8,
    ) -> Result<(), AudioError> {
        let (track, params) = match self {
            AudioChannel::Saud(c) => (c.track, &mut c.params),
            AudioChannel::Imuse(c) => (c.track, &mut c.params),
            AudioChannel::Interleaved(_) => return Ok(()),
        };
        check_segment(track, params, index, frame_count, flags)?;
        if let Some(p) = params.as_mut() {
            p.volume = volume;
            p.pan = pan;
        }
        Ok(())
    }

    pub fn append_data(&mut self, data: &[u8]) -> Result<(), AudioError> {
        match self {
            AudioChannel::Saud(c) => c.buffer.feed(&mut c.tree, c.track, data),
            AudioChannel::Imuse(c) => {
                c.buffer.feed(&mut c.tree, c.track, data)?;
                c.convert()
            }
            AudioChannel::Interleaved(c) => c.append(data),
        }
    }

    /// The end of the track's data has been seen.
    pub fn is_terminated(&self) -> bool {
        match self {
            AudioChannel::Saud(c) => c.is_terminated(),
            AudioChannel::Imuse(c) => c.buffer.data_complete,
            AudioChannel::Interleaved(_) => false,
        }
    }

    /// Terminated with nothing left for the mixer.
    pub fn is_done(&self) -> bool {
        self.is_terminated() && self.ready_len() == 0
    }

    pub fn ready_len(&self) -> usize {
        match self {
            AudioChannel::Saud(c) => c.buffer.raw.len(),
            AudioChannel::Imuse(c) => c.ready.len(),
            AudioChannel::Interleaved(c) => c.ready.len(),
        }
    }

    pub fn take_ready_data(&mut self) -> Vec<u8> {
        match self {
            AudioChannel::Saud(c) => std::mem::take(&mut c.buffer.raw),
            AudioChannel::Imuse(c) => std::mem::take(&mut c.ready),
            AudioChannel::Interleaved(c) => std::mem::take(&mut c.ready),
        }
    }

    /// Bytes still to be delivered: ready output plus declared sample data not yet received.
    pub fn owed_bytes(&self) -> usize {
        match self {
            AudioChannel::Saud(c) => c.buffer.raw.len() + c.buffer.remaining(),
            AudioChannel::Imuse(c) => c.ready.len() + c.buffer.raw.len() + c.buffer.remaining(),
            AudioChannel::Interleaved(c) => c.ready.len() + c.block.len(),
        }
    }

    /// Output format, once known.
    pub fn format(&self) -> Option<PcmFormat> {
        match self {
            AudioChannel::Saud(_) => Some(PcmFormat {
                rate: SAUD_RATE,
                channels: 1,
                sample: SampleFormat::U8,
            }),
            AudioChannel::Imuse(c) => c.format(),
            AudioChannel::Interleaved(_) => Some(PcmFormat {
                rate: INTERLEAVED_RATE,
                channels: 2,
                sample: SampleFormat::S16Be,
            }),
        }
    }

    pub fn volume(&self) -> u8 {
        match self {
            AudioChannel::Saud(c) => c.params.map_or(127, |p| p.volume),
            AudioChannel::Imuse(c) => c.params.map_or(127, |p| iact_volume(p.flags)),
            AudioChannel::Interleaved(_) => 127,
        }
    }

    pub fn pan(&self) -> i8 {
        match self {
            AudioChannel::Saud(c) => c.params.map_or(0, |p| p.pan),
            _ => 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
