//! # Codec Dispatch
//!
//! Maps a frame object's codec id to a pixel decoder and writes the result
//! into one of the session's pre-sized surfaces.
//!
//! ## Target selection
//! 1. 384×242 objects go to the auxiliary surface
//! 2. Objects larger than the display are dropped
//! 3. Objects of any other size are dropped unless permissive mode is on
//!    (sprite overlays drawn by game logic)
//!
//! Codecs 1/3 (line RLE) and 20 (uncompressed) are built in; the block-delta
//! codecs are supplied by the host through [`CodecRegistry::register`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use thiserror::Error;

use crate::chunk::{ChunkError, FieldReader};

/// The one oversized frame shape that is kept, on its own surface.
pub const AUX_WIDTH: usize = 384;
pub const AUX_HEIGHT: usize = 242;

/// FOBJ header: codec, left, top, width, height, two reserved words.
pub const FRAME_OBJECT_HEADER: usize = 14;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unknown codec {codec}")]
    UnknownCodec { codec: u16 },
    #[error("Codec {codec} data is corrupt: {reason}")]
    Corrupt { codec: u16, reason: String },
    #[error("Zlib frame object failed to inflate: {0}")]
    Inflate(std::io::Error),
    #[error("Zlib frame object inflated to {actual} bytes, header says {expected}")]
    InflateSize { expected: usize, actual: usize },
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

// ============================================================================
// Frame objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameObject {
    pub codec: u16,
    pub left: i16,
    pub top: i16,
    pub width: u16,
    pub height: u16,
}

impl FrameObject {
    /// Splits an FOBJ payload into its header and codec data.
    pub fn parse(payload: &[u8], base: u64) -> Result<(Self, &[u8]), DecodeError> {
        let mut fields = FieldReader::new(payload, base);
        let object = FrameObject {
            codec: fields.u16_le()?,
            left: fields.i16_le()?,
            top: fields.i16_le()?,
            width: fields.u16_le()?,
            height: fields.u16_le()?,
        };
        fields.skip(4)?;
        Ok((object, fields.rest()))
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width as usize, self.height as usize)
    }
}

/// Inflates a ZFOB payload back into a complete FOBJ payload.
pub fn inflate_frame_object(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Chunk(ChunkError::Truncated { offset: 0 }));
    }
    let expected = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;

    let mut out = Vec::with_capacity(expected.min(1 << 24));
    ZlibDecoder::new(&payload[4..])
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(DecodeError::Inflate)?;

    if out.len() != expected {
        return Err(DecodeError::InflateSize {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

// ============================================================================
// Surfaces
// ============================================================================

/// 8-bit indexed pixel surface.
pub struct Surface {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Surface {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    /// Writes one pixel, ignoring coordinates outside the surface.
    #[inline]
    pub fn put(&mut self, x: i32, y: i32, color: u8) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            self.pixels[y as usize * self.width + x as usize] = color;
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Option<u8> {
        if x < self.width && y < self.height {
            Some(self.pixels[y * self.width + x])
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceId {
    Main,
    Auxiliary,
}

/// Arena of every surface a session draws into, allocated once.
pub struct Surfaces {
    main: Surface,
    aux: Surface,
    store: Vec<u8>,
    stored: Option<SurfaceId>,
    target: Option<SurfaceId>,
}

impl Surfaces {
    pub fn new(width: usize, height: usize) -> Self {
        let largest = (width * height).max(AUX_WIDTH * AUX_HEIGHT);
        Self {
            main: Surface::new(width, height),
            aux: Surface::new(AUX_WIDTH, AUX_HEIGHT),
            store: vec![0; largest],
            stored: None,
            target: None,
        }
    }

    pub fn get(&self, id: SurfaceId) -> &Surface {
        match id {
            SurfaceId::Main => &self.main,
            SurfaceId::Auxiliary => &self.aux,
        }
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> &mut Surface {
        match id {
            SurfaceId::Main => &mut self.main,
            SurfaceId::Auxiliary => &mut self.aux,
        }
    }

    /// Surface the last frame object was decoded into.
    pub fn target(&self) -> Option<SurfaceId> {
        self.target
    }

    pub fn set_target(&mut self, id: SurfaceId) {
        self.target = Some(id);
    }

    pub fn store(&mut self, id: SurfaceId) {
        let surface = match id {
            SurfaceId::Main => &self.main,
            SurfaceId::Auxiliary => &self.aux,
        };
        self.store[..surface.pixels.len()].copy_from_slice(&surface.pixels);
        self.stored = Some(id);
    }

    /// Copies the stored frame back. Returns false when nothing was stored.
    pub fn fetch(&mut self) -> bool {
        let Some(id) = self.stored else {
            return false;
        };
        let surface = match id {
            SurfaceId::Main => &mut self.main,
            SurfaceId::Auxiliary => &mut self.aux,
        };
        let len = surface.pixels.len();
        surface.pixels.copy_from_slice(&self.store[..len]);
        self.target = Some(id);
        true
    }

    pub fn reset(&mut self) {
        self.main.clear();
        self.aux.clear();
        self.stored = None;
        self.target = None;
    }
}

// ============================================================================
// Codec registry
// ============================================================================

/// A pixel decoder bound to one (codec, width, height) combination.
pub trait PixelCodec: Send {
    fn decode(&mut self, dst: &mut Surface, object: &FrameObject, src: &[u8]) -> Result<(), DecodeError>;

    fn name(&self) -> &str;
}

pub type CodecFactory = Box<dyn Fn(u16, u16) -> Box<dyn PixelCodec> + Send>;

pub struct CodecRegistry {
    factories: HashMap<u16, CodecFactory>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in codecs.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(1, Box::new(|_, _| Box::new(PlainOrRleCodec) as Box<dyn PixelCodec>));
        registry.register(3, Box::new(|_, _| Box::new(LineRleCodec) as Box<dyn PixelCodec>));
        registry.register(20, Box::new(|_, _| Box::new(RawCodec) as Box<dyn PixelCodec>));
        registry
    }

    pub fn register(&mut self, codec: u16, factory: CodecFactory) {
        self.factories.insert(codec, factory);
    }

    pub fn supports(&self, codec: u16) -> bool {
        self.factories.contains_key(&codec)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub struct CodecDispatch {
    registry: CodecRegistry,
    instances: HashMap<(u16, u16, u16), Box<dyn PixelCodec>>,
    surfaces: Surfaces,
    store_pending: bool,
    permissive: bool,
}

impl CodecDispatch {
    pub fn new(registry: CodecRegistry, width: usize, height: usize, permissive: bool) -> Self {
        Self {
            registry,
            instances: HashMap::new(),
            surfaces: Surfaces::new(width, height),
            store_pending: false,
            permissive,
        }
    }

    pub fn surfaces(&self) -> &Surfaces {
        &self.surfaces
    }

    pub fn surfaces_mut(&mut self) -> &mut Surfaces {
        &mut self.surfaces
    }

    pub fn registry_mut(&mut self) -> &mut CodecRegistry {
        &mut self.registry
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// The next decoded surface is copied to the store buffer.
    pub fn arm_store(&mut self) {
        self.store_pending = true;
    }

    pub fn fetch(&mut self) -> bool {
        self.surfaces.fetch()
    }

    /// Decodes one frame object. `Ok(None)` means the size policy dropped it.
    pub fn decode(&mut self, object: &FrameObject, data: &[u8]) -> Result<Option<SurfaceId>, DecodeError> {
        let (width, height) = object.size();
        let (screen_w, screen_h) = (self.surfaces.main.width, self.surfaces.main.height);

        let target = if (width, height) == (AUX_WIDTH, AUX_HEIGHT) {
            SurfaceId::Auxiliary
        } else if width > screen_w || height > screen_h {
            tracing::debug!("Dropping oversized {}x{} frame object", width, height);
            return Ok(None);
        } else if !self.permissive && (width != screen_w || height != screen_h) {
            tracing::debug!("Dropping partial {}x{} frame object", width, height);
            return Ok(None);
        } else {
            SurfaceId::Main
        };

        let key = (object.codec, object.width, object.height);
        let codec = match self.instances.entry(key) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let factory = self
                    .registry
                    .factories
                    .get(&object.codec)
                    .ok_or(DecodeError::UnknownCodec { codec: object.codec })?;
                let instance = factory(object.width, object.height);
                tracing::debug!(
                    "Created {} decoder for codec {} at {}x{}",
                    instance.name(),
                    object.codec,
                    width,
                    height
                );
                slot.insert(instance)
            }
        };

        codec.decode(self.surfaces.get_mut(target), object, data)?;
        self.surfaces.set_target(target);

        if self.store_pending {
            self.surfaces.store(target);
            self.store_pending = false;
        }
        Ok(Some(target))
    }

    /// Forgets codec state and stored frames; used when a new container opens.
    pub fn reset(&mut self) {
        self.instances.clear();
        self.surfaces.reset();
        self.store_pending = false;
    }
}

// ============================================================================
// Built-in codecs
// ============================================================================

/// Per-line run-length codec; colour 0 is transparent.
pub struct LineRleCodec;

impl PixelCodec for LineRleCodec {
    fn decode(&mut self, dst: &mut Surface, object: &FrameObject, src: &[u8]) -> Result<(), DecodeError> {
        let corrupt = |reason: &str| DecodeError::Corrupt {
            codec: object.codec,
            reason: reason.to_string(),
        };

        let mut cursor = 0usize;
        for line in 0..i32::from(object.height) {
            let header = src.get(cursor..cursor + 2).ok_or_else(|| corrupt("line header past end"))?;
            let length = u16::from_le_bytes([header[0], header[1]]) as usize;
            cursor += 2;
            let end = cursor + length;
            if end > src.len() {
                return Err(corrupt("line data past end"));
            }

            let y = i32::from(object.top) + line;
            let mut x = i32::from(object.left);
            let mut p = cursor;
            while p < end {
                let code = src[p];
                p += 1;
                let count = (code >> 1) as usize + 1;
                if code & 1 == 1 {
                    let color = *src.get(p).filter(|_| p < end).ok_or_else(|| corrupt("fill past line end"))?;
                    p += 1;
                    if color != 0 {
                        for i in 0..count {
                            dst.put(x + i as i32, y, color);
                        }
                    }
                } else {
                    if p + count > end {
                        return Err(corrupt("literal run past line end"));
                    }
                    for (i, &color) in src[p..p + count].iter().enumerate() {
                        if color != 0 {
                            dst.put(x + i as i32, y, color);
                        }
                    }
                    p += count;
                }
                x += count as i32;
            }
            cursor = end;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "line-rle"
    }
}

/// Uncompressed rows of `width` bytes.
pub struct RawCodec;

impl PixelCodec for RawCodec {
    fn decode(&mut self, dst: &mut Surface, object: &FrameObject, src: &[u8]) -> Result<(), DecodeError> {
        let (width, height) = object.size();
        if src.len() < width * height {
            return Err(DecodeError::Corrupt {
                codec: object.codec,
                reason: format!("{} bytes for a {}x{} frame", src.len(), width, height),
            });
        }
        for (line, row) in src.chunks_exact(width.max(1)).take(height).enumerate() {
            let y = i32::from(object.top) + line as i32;
            for (i, &color) in row.iter().enumerate() {
                dst.put(i32::from(object.left) + i as i32, y, color);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "raw"
    }
}

/// Codec 1: a payload of exactly `width * height` bytes is a stored frame,
/// anything else is line RLE.
pub struct PlainOrRleCodec;

impl PixelCodec for PlainOrRleCodec {
    fn decode(&mut self, dst: &mut Surface, object: &FrameObject, src: &[u8]) -> Result<(), DecodeError> {
        let (width, height) = object.size();
        if src.len() == width * height {
            RawCodec.decode(dst, object, src)
        } else {
            LineRleCodec.decode(dst, object, src)
        }
    }

    fn name(&self) -> &str {
        "plain-or-rle"
    }
}

// ============================================================================
// Tests
// ============================================================================
