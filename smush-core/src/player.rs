//! # Playback Session - Demux, Decode, Present
//!
//! One [`PlaybackSession`] plays one container at a time. The host calls
//! [`tick`](PlaybackSession::tick) from its update loop; each call decodes at
//! most one frame and says what happened to it.
//!
//! ```text
//! play() ──► SEEK_PENDING ──tick──► PLAYING ──end──► FINISHED
//!                 ▲                    │
//!                 └─────── seek() ─────┤
//!                                      └─stop / error──► ABORTED
//! ```
//!
//! Seek offsets are relative to the ANIM payload, so offset 0 is the AHDR
//! chunk. Offsets past the header join the container mid-stream: the header
//! is scanned for its palette and audio tracks may start at any segment.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{iact_volume, AudioChannel, AudioError, IactHeader, SoundSegment};
use crate::chunk::{AnimHeader, Chunk, ChunkError, SmushStream, Tag};
use crate::codec::{inflate_frame_object, CodecDispatch, CodecRegistry, DecodeError, FrameObject, SurfaceId};
use crate::config::{AudioLayout, PlaybackConfig};
use crate::host::{side_audio_candidates, AssetSource, AudioMixer, Display, SoundHandle};
use crate::mixer::ChannelRegistry;
use crate::palette::{Palette, PaletteError, PALETTE_BYTES};
use crate::sync::{FrameClock, FrameDecision, SkipTracker};
use crate::text::{BlockFont, FontSet, StringTable, TextChunk, TextError, TextOverlay};

/// Registry id of the interleaved IACT stream.
pub const INTERLEAVED_TRACK: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Palette(#[from] PaletteError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error("Failed to open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} has no AHDR header")]
    MissingHeader(String),
    #[error("Seek without an open container")]
    NoContainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    SeekPending,
    Playing,
    Finished,
    Aborted,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationCommand {
    /// Nothing loaded
    Idle,
    /// Next frame not due yet
    Wait,
    /// Frame decoded and shown
    Present { frame: u32 },
    /// Frame decoded, display update skipped to catch up
    Skip { frame: u32 },
    /// End of container reached
    Finished,
    /// Stopped by the host or by an error
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub decoded: u64,
    pub presented: u64,
    pub skipped: u64,
    pub palette_flushes: u64,
    pub seeks: u64,
    pub dropped_objects: u64,
}

/// Cloneable flag that ends playback at the next tick.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct SeekRequest {
    name: Option<String>,
    offset: u64,
    frame: u32,
}

pub struct PlaybackSession<D: Display, M: AudioMixer> {
    display: D,
    mixer: M,
    assets: Box<dyn AssetSource>,
    fonts: Box<dyn FontSet>,
    config: PlaybackConfig,

    state: PlaybackState,
    name: Option<String>,
    stream: Option<SmushStream>,
    header: Option<AnimHeader>,
    pending_seek: Option<SeekRequest>,

    clock: FrameClock,
    skips: SkipTracker,
    frame: u32,

    palette: Palette,
    skip_palette: bool,
    codecs: CodecDispatch,
    text: TextOverlay,

    channels: ChannelRegistry,
    middle_audio: bool,
    compressed: Option<SoundHandle>,

    skip_next_object: bool,
    conditions: BTreeSet<u16>,

    stop: StopHandle,
    stats: PlaybackStats,
}

impl<D: Display, M: AudioMixer> PlaybackSession<D, M> {
    pub fn new(display: D, mixer: M, assets: Box<dyn AssetSource>, config: PlaybackConfig) -> Self {
        Self::with_codecs(display, mixer, assets, config, CodecRegistry::with_builtin())
    }

    pub fn with_codecs(
        display: D,
        mixer: M,
        assets: Box<dyn AssetSource>,
        config: PlaybackConfig,
        registry: CodecRegistry,
    ) -> Self {
        let codecs = CodecDispatch::new(
            registry,
            config.screen_width,
            config.screen_height,
            config.permissive_sizes,
        );
        Self {
            display,
            mixer,
            assets,
            fonts: Box::new(BlockFont::default()),
            state: PlaybackState::Idle,
            name: None,
            stream: None,
            header: None,
            pending_seek: None,
            clock: FrameClock::new(config.default_fps),
            skips: SkipTracker::new(config.skip_streak_limit),
            frame: 0,
            palette: Palette::new(),
            skip_palette: false,
            codecs,
            text: TextOverlay::new(config.subtitles),
            channels: ChannelRegistry::new(config.max_channels),
            middle_audio: false,
            compressed: None,
            skip_next_object: false,
            conditions: BTreeSet::new(),
            stop: StopHandle::default(),
            stats: PlaybackStats::default(),
            config,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn mixer(&self) -> &M {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut M {
        &mut self.mixer
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    /// Number of the next frame to decode.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn header(&self) -> Option<&AnimHeader> {
        self.header.as_ref()
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn set_fonts(&mut self, fonts: Box<dyn FontSet>) {
        self.fonts = fonts;
    }

    pub fn codec_registry_mut(&mut self) -> &mut CodecRegistry {
        self.codecs.registry_mut()
    }

    /// Game-state bit consulted by `SKIP` chunks.
    pub fn set_condition_bit(&mut self, bit: u16, value: bool) {
        if value {
            self.conditions.insert(bit);
        } else {
            self.conditions.remove(&bit);
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Starts `name` at `offset` with `start_frame` as the pacing baseline.
    pub fn play(&mut self, name: &str, fps: u32, offset: u64, start_frame: u32) {
        self.clock.set_fps(if fps == 0 { self.config.default_fps } else { fps });
        self.stop.clear();
        self.stats = PlaybackStats::default();

        let strings = self.config.strings_file.clone().and_then(|file| match self.assets.open(&file) {
            Ok(data) => Some(StringTable::from_bytes(&data)),
            Err(e) => {
                tracing::warn!("String table {} unavailable, TRES text disabled: {}", file, e);
                None
            }
        });
        self.text.set_strings(strings);

        tracing::info!("Playing {} at {} fps from offset {} (frame {})", name, self.clock.fps(), offset, start_frame);
        self.seek(Some(name), offset, start_frame);
    }

    /// Queues a seek, applied at the next tick. `None` stays in the open container.
    pub fn seek(&mut self, name: Option<&str>, offset: u64, frame: u32) {
        self.pending_seek = Some(SeekRequest {
            name: name.map(str::to_string),
            offset,
            frame,
        });
        self.state = PlaybackState::SeekPending;
    }

    pub fn pause(&mut self, now_ms: u64) {
        self.clock.pause(now_ms);
    }

    pub fn resume(&mut self, now_ms: u64) {
        self.clock.resume(now_ms);
    }

    pub fn is_paused(&self) -> bool {
        self.clock.is_paused()
    }

    /// Advances playback to `now_ms`. Format violations abort the session.
    pub fn tick(&mut self, now_ms: u64) -> Result<PresentationCommand, PlaybackError> {
        if self.stop.is_stopped() {
            if !matches!(self.state, PlaybackState::Aborted | PlaybackState::Idle) {
                tracing::info!("Playback stopped at frame {}", self.frame);
                self.teardown();
                self.state = PlaybackState::Aborted;
            }
            return Ok(PresentationCommand::Stopped);
        }

        match self.state {
            PlaybackState::Idle => return Ok(PresentationCommand::Idle),
            PlaybackState::Finished => return Ok(PresentationCommand::Finished),
            PlaybackState::Aborted => return Ok(PresentationCommand::Stopped),
            PlaybackState::SeekPending | PlaybackState::Playing => {}
        }

        match self.step(now_ms) {
            Ok(command) => Ok(command),
            Err(e) => {
                tracing::warn!("Aborting playback at frame {}: {}", self.frame, e);
                self.teardown();
                self.state = PlaybackState::Aborted;
                Err(e)
            }
        }
    }

    fn step(&mut self, now_ms: u64) -> Result<PresentationCommand, PlaybackError> {
        if let Some(request) = self.pending_seek.take() {
            self.apply_seek(request, now_ms)?;
        }
        if self.clock.is_paused() {
            return Ok(PresentationCommand::Wait);
        }

        let compressed = self
            .compressed
            .filter(|h| self.mixer.is_active(*h))
            .and_then(|h| self.mixer.elapsed_ms(h));
        let interleaved = self
            .channels
            .handle(INTERLEAVED_TRACK)
            .filter(|h| self.mixer.is_active(*h))
            .and_then(|h| self.mixer.elapsed_ms(h));
        let (elapsed, _) = self.clock.elapsed(now_ms, compressed, interleaved);

        let skippable = match self.clock.decide(self.frame, elapsed) {
            FrameDecision::Wait => return Ok(PresentationCommand::Wait),
            FrameDecision::Decode { skippable } => skippable,
        };

        if !self.decode_next_frame()? {
            tracing::info!(
                "Finished after {} frames ({} presented, {} skipped)",
                self.stats.decoded,
                self.stats.presented,
                self.stats.skipped
            );
            self.teardown();
            self.state = PlaybackState::Finished;
            return Ok(PresentationCommand::Finished);
        }
        self.channels.pump(&mut self.mixer);

        let frame = self.frame;
        self.frame += 1;

        // Skipped frames leave the palette dirty for the next presented one
        if self.skips.resolve(skippable) {
            if self.flush_palette() {
                self.skips.palette_flushed();
            }
            self.present();
            self.stats.presented += 1;
            Ok(PresentationCommand::Present { frame })
        } else {
            tracing::debug!("Skipping display of frame {}", frame);
            self.stats.skipped += 1;
            Ok(PresentationCommand::Skip { frame })
        }
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    fn apply_seek(&mut self, request: SeekRequest, now_ms: u64) -> Result<(), PlaybackError> {
        self.channels.stop_all(&mut self.mixer);
        self.skip_next_object = false;

        match request.name {
            Some(name) => {
                if let Some(handle) = self.compressed.take() {
                    self.mixer.stop_handle(handle);
                }
                let data = self.assets.open(&name).map_err(|source| PlaybackError::Open {
                    name: name.clone(),
                    source,
                })?;
                let mut stream = SmushStream::open(data)?;
                self.codecs.reset();
                self.middle_audio = false;

                if request.offset > 0 {
                    let header = match stream.reader().scan_for(Tag::AHDR)? {
                        Some(chunk) => AnimHeader::parse(&chunk)?,
                        None => return Err(PlaybackError::MissingHeader(name)),
                    };
                    self.palette.load_silent(&header.palette)?;
                    self.header = Some(header);
                    self.middle_audio = true;
                } else {
                    self.header = None;
                    self.start_side_audio(&name);
                }
                self.skip_palette = false;
                self.stream = Some(stream);
                self.name = Some(name);
            }
            None => {
                if self.stream.is_none() {
                    return Err(PlaybackError::NoContainer);
                }
                if request.offset == 0 {
                    if let Some(handle) = self.compressed.take() {
                        self.mixer.stop_handle(handle);
                    }
                }
                self.skip_palette = true;
                self.middle_audio = request.offset > 0;
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            if request.offset == 0 {
                stream.reader().rewind();
            } else {
                stream.seek_absolute(request.offset)?;
            }
        }
        self.frame = request.frame;
        self.clock.restart(now_ms, request.frame);
        self.skips.reset();
        self.stats.seeks += 1;
        self.state = PlaybackState::Playing;

        tracing::debug!("Seeked to offset {} (frame {})", request.offset, request.frame);
        Ok(())
    }

    fn start_side_audio(&mut self, name: &str) {
        for candidate in side_audio_candidates(name, &self.config.compressed_audio_extensions) {
            if !self.assets.exists(&candidate) {
                continue;
            }
            match self.assets.open(&candidate) {
                Ok(data) => {
                    if let Some(handle) = self.mixer.play_compressed(&candidate, data) {
                        tracing::info!("Using compressed audio {}", candidate);
                        self.compressed = Some(handle);
                        return;
                    }
                }
                Err(e) => tracing::debug!("Could not open {}: {}", candidate, e),
            }
        }
    }

    fn teardown(&mut self) {
        self.channels.stop_all(&mut self.mixer);
        if let Some(handle) = self.compressed.take() {
            self.mixer.stop_handle(handle);
        }
        self.stream = None;
        self.pending_seek = None;
        self.codecs.reset();
    }

    // ========================================================================
    // Frame decoding
    // ========================================================================

    /// Decodes the next FRME, handling any AHDR on the way. False at end of container.
    fn decode_next_frame(&mut self) -> Result<bool, PlaybackError> {
        loop {
            let next = match self.stream.as_mut() {
                Some(stream) => stream.next_chunk()?,
                None => return Ok(false),
            };
            let Some(chunk) = next else {
                return Ok(false);
            };
            match chunk.tag {
                Tag::AHDR => self.handle_header(&chunk)?,
                Tag::FRME => {
                    self.handle_frame(&chunk)?;
                    return Ok(true);
                }
                other => {
                    return Err(ChunkError::UnknownTag {
                        tag: other,
                        offset: chunk.offset,
                    }
                    .into())
                }
            }
        }
    }

    fn handle_header(&mut self, chunk: &Chunk) -> Result<(), PlaybackError> {
        let header = AnimHeader::parse(chunk)?;
        tracing::debug!("AHDR version {} with {} frames", header.version, header.frame_count);
        if self.skip_palette {
            // Looping back over the header must not reset the palette
            self.skip_palette = false;
        } else {
            self.palette.set_full(&header.palette)?;
        }
        self.header = Some(header);
        Ok(())
    }

    fn handle_frame(&mut self, frame: &Chunk) -> Result<(), PlaybackError> {
        self.stats.decoded += 1;
        let mut subs = frame.children();
        while let Some(sub) = subs.next_subchunk()? {
            match sub.tag {
                Tag::NPAL => {
                    if !self.skip_palette {
                        sub.require(PALETTE_BYTES)?;
                        self.palette.set_full(&sub.payload)?;
                    }
                }
                Tag::XPAL => {
                    if !self.skip_palette {
                        self.palette.apply_xpal(&sub.payload)?;
                    }
                }
                Tag::FOBJ => self.handle_frame_object(&sub.payload, sub.data_offset())?,
                Tag::ZFOB => {
                    let inflated = inflate_frame_object(&sub.payload)?;
                    self.handle_frame_object(&inflated, sub.data_offset())?;
                }
                Tag::PSAD => self.handle_sound_segment(&sub)?,
                Tag::IACT => self.handle_iact(&sub)?,
                Tag::TEXT | Tag::TRES => self.handle_text(&sub)?,
                Tag::STOR => {
                    sub.require(4)?;
                    self.codecs.arm_store();
                }
                Tag::FTCH => {
                    sub.require(6)?;
                    if !self.codecs.fetch() {
                        tracing::debug!("FTCH with no stored frame at {:#x}", sub.offset);
                    }
                }
                Tag::SKIP => self.handle_skip(&sub)?,
                other => {
                    return Err(ChunkError::UnknownTag {
                        tag: other,
                        offset: sub.offset,
                    }
                    .into())
                }
            }
        }
        Ok(())
    }

    fn handle_frame_object(&mut self, payload: &[u8], base: u64) -> Result<(), PlaybackError> {
        if std::mem::take(&mut self.skip_next_object) {
            tracing::debug!("Frame object skipped by condition");
            return Ok(());
        }
        let (object, data) = FrameObject::parse(payload, base)?;
        if self.codecs.decode(&object, data)?.is_none() {
            self.stats.dropped_objects += 1;
        }
        Ok(())
    }

    fn handle_skip(&mut self, sub: &Chunk) -> Result<(), PlaybackError> {
        sub.require(2)?;
        let mut f = sub.fields();
        let par1 = f.u16_le()?;
        let par2 = if f.remaining() >= 2 { f.u16_le()? } else { 0 };

        let conditions = &self.conditions;
        let bit = |b: u16| conditions.contains(&b);
        let skip = if par2 == 0 { bit(par1) } else { bit(par1) != bit(par2) };
        self.skip_next_object = skip;
        Ok(())
    }

    fn handle_text(&mut self, sub: &Chunk) -> Result<(), PlaybackError> {
        let chunk = TextChunk::parse(sub.tag, &sub.payload, sub.data_offset())?;
        let target = self.codecs.surfaces().target().unwrap_or(SurfaceId::Main);
        let surface = self.codecs.surfaces_mut().get_mut(target);
        self.text.render(&chunk, surface, self.fonts.as_ref())?;
        Ok(())
    }

    // ========================================================================
    // Audio segments
    // ========================================================================

    fn handle_sound_segment(&mut self, sub: &Chunk) -> Result<(), PlaybackError> {
        if self.compressed.is_some() {
            return Ok(());
        }
        let (segment, data) = SoundSegment::parse(&sub.payload, sub.data_offset())?;
        let track = u32::from(segment.track);
        let middle = self.middle_audio;

        let Some(channel) = self.channels.get_or_create(track, || AudioChannel::saud(track)) else {
            return Ok(());
        };
        if segment.index == 0 || (middle && !channel.is_initialized()) {
            channel.set_parameters(segment.index, segment.max_frames, segment.flags, segment.volume, segment.pan);
        } else {
            channel.check_parameters(segment.index, segment.max_frames, segment.flags, segment.volume, segment.pan)?;
        }
        channel.append_data(data)?;
        Ok(())
    }

    fn handle_iact(&mut self, sub: &Chunk) -> Result<(), PlaybackError> {
        let (header, data) = IactHeader::parse(&sub.payload, sub.data_offset())?;
        if !header.is_audio() {
            tracing::debug!("Ignoring IACT opcode {} flags {}", header.code, header.flags);
            return Ok(());
        }
        if header.reserved != 0 {
            return Err(AudioError::IactReserved(header.reserved).into());
        }

        match self.config.audio_layout {
            AudioLayout::Interleaved => {
                if self.compressed.is_some() {
                    return Ok(());
                }
                let joining = self.middle_audio;
                let make = || {
                    if joining {
                        AudioChannel::interleaved_joining(INTERLEAVED_TRACK)
                    } else {
                        AudioChannel::interleaved(INTERLEAVED_TRACK)
                    }
                };
                if let Some(channel) = self.channels.get_or_create(INTERLEAVED_TRACK, make) {
                    channel.append_data(data)?;
                }
            }
            AudioLayout::Tracked => {
                let id = header.channel_id()?;
                let volume = iact_volume(header.track_flags);
                if header.index == 0 {
                    let Some(channel) = self.channels.get_or_create(id, || AudioChannel::imuse(id)) else {
                        return Ok(());
                    };
                    channel.set_parameters(0, header.frame_count, header.track_flags, volume, 0);
                    channel.append_data(data)?;
                } else {
                    match self.channels.find_mut(id) {
                        Some(channel) if channel.is_initialized() => {
                            channel.check_parameters(header.index, header.frame_count, header.track_flags, volume, 0)?;
                            channel.append_data(data)?;
                        }
                        _ => tracing::debug!("Dropping IACT segment {} of unstarted track {}", header.index, id),
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn flush_palette(&mut self) -> bool {
        match self.palette.take_dirty() {
            Some(update) => {
                self.display.set_palette(update.first, &update.rgb);
                self.stats.palette_flushes += 1;
                true
            }
            None => false,
        }
    }

    fn present(&mut self) {
        let target = self.codecs.surfaces().target().unwrap_or(SurfaceId::Main);
        let surface = self.codecs.surfaces().get(target);
        let width = surface.width.min(self.config.screen_width);
        let height = surface.height.min(self.config.screen_height);
        self.display.copy_rect(&surface.pixels, surface.width, 0, 0, width, height);
        self.display.present();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryAssets;
    use crate::mixer::PcmStream;
    use crate::testing::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingDisplay {
        palettes: Vec<(usize, Vec<u8>)>,
        staged: Vec<u8>,
        frames: Vec<Vec<u8>>,
    }

    impl Display for RecordingDisplay {
        fn set_palette(&mut self, first: usize, rgb: &[u8]) {
            self.palettes.push((first, rgb.to_vec()));
        }

        fn copy_rect(&mut self, pixels: &[u8], pitch: usize, _x: usize, _y: usize, width: usize, height: usize) {
            self.staged.clear();
            for row in 0..height {
                self.staged.extend_from_slice(&pixels[row * pitch..row * pitch + width]);
            }
        }

        fn present(&mut self) {
            self.frames.push(self.staged.clone());
        }
    }

    #[derive(Default)]
    struct TestMixer {
        next: u32,
        streams: HashMap<SoundHandle, PcmStream>,
        stopped: Vec<SoundHandle>,
        compressed: Option<SoundHandle>,
        compressed_ms: u64,
    }

    impl AudioMixer for TestMixer {
        fn play_stream(&mut self, stream: PcmStream) -> SoundHandle {
            self.next += 1;
            self.streams.insert(SoundHandle(self.next), stream);
            SoundHandle(self.next)
        }

        fn play_compressed(&mut self, _name: &str, _data: Bytes) -> Option<SoundHandle> {
            self.next += 1;
            self.compressed = Some(SoundHandle(self.next));
            self.compressed
        }

        fn stop_handle(&mut self, handle: SoundHandle) {
            self.stopped.push(handle);
            if self.compressed == Some(handle) {
                self.compressed = None;
            }
        }

        fn elapsed_ms(&self, handle: SoundHandle) -> Option<u64> {
            (self.compressed == Some(handle)).then_some(self.compressed_ms)
        }

        fn is_active(&self, handle: SoundHandle) -> bool {
            self.compressed == Some(handle)
        }

        fn set_volume_pan(&mut self, _handle: SoundHandle, _volume: u8, _pan: i8) {}
    }

    type Session = PlaybackSession<RecordingDisplay, TestMixer>;

    fn small_config() -> PlaybackConfig {
        PlaybackConfig {
            screen_width: 4,
            screen_height: 2,
            default_fps: 10,
            ..Default::default()
        }
    }

    fn session_with(files: &[(&str, Vec<u8>)]) -> Session {
        let mut assets = MemoryAssets::new();
        for (name, data) in files {
            assets.insert(*name, data.clone());
        }
        PlaybackSession::new(
            RecordingDisplay::default(),
            TestMixer::default(),
            Box::new(assets),
            small_config(),
        )
    }

    /// AHDR plus `n` frames, frame `k` filled with colour `k + 1`.
    fn numbered_container(n: u8) -> Vec<u8> {
        let mut parts = vec![ahdr(2, u16::from(n), &grey_palette(50))];
        parts.extend((0..n).map(|k| frame(&[rle_fobj(4, 2, k + 1)])));
        anim(&parts)
    }

    fn frame_offset(data: &[u8], n: usize) -> u64 {
        crate::probe::probe(Bytes::copy_from_slice(data))
            .unwrap()
            .frame_offset(n)
            .unwrap()
    }

    #[test]
    fn test_clean_playback() {
        let mut session = session_with(&[("clean.san", numbered_container(3))]);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Idle);

        session.play("clean.san", 10, 0, 0);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 0 });
        assert_eq!(session.tick(50).unwrap(), PresentationCommand::Wait);
        assert_eq!(session.tick(100).unwrap(), PresentationCommand::Present { frame: 1 });
        assert_eq!(session.tick(200).unwrap(), PresentationCommand::Present { frame: 2 });
        assert_eq!(session.tick(300).unwrap(), PresentationCommand::Finished);
        assert_eq!(session.state(), PlaybackState::Finished);

        let display = session.display();
        assert_eq!(display.frames, vec![vec![1; 8], vec![2; 8], vec![3; 8]]);
        assert_eq!(display.palettes.len(), 1);
        assert_eq!(display.palettes[0], (0, vec![50; 768]));
        assert_eq!(session.stats().presented, 3);
    }

    #[test]
    fn test_clean_playback_stored_frames() {
        let frames: Vec<Vec<u8>> = (0..3u8).map(|k| (0..8).map(|i| k * 10 + i).collect()).collect();
        let mut parts = vec![ahdr(2, 3, &grey_palette(50))];
        parts.extend(frames.iter().map(|pixels| frame(&[raw_fobj(4, 2, pixels)])));
        let mut session = session_with(&[("raw.san", anim(&parts))]);

        session.play("raw.san", 10, 0, 0);
        for k in 0..3u32 {
            assert_eq!(
                session.tick(u64::from(k) * 100).unwrap(),
                PresentationCommand::Present { frame: k }
            );
        }
        assert_eq!(session.tick(300).unwrap(), PresentationCommand::Finished);
        assert_eq!(session.display().frames, frames);
        assert_eq!(session.display().palettes, vec![(0, vec![50; 768])]);
    }

    #[test]
    fn test_fade_to_black() {
        let mut parts = vec![
            ahdr(2, 9, &grey_palette(200)),
            frame(&[xpal_set(-200, &grey_palette(200)), rle_fobj(4, 2, 1)]),
        ];
        parts.extend((0..8).map(|_| frame(&[xpal_apply(), rle_fobj(4, 2, 1)])));
        let mut session = session_with(&[("fade.san", anim(&parts))]);

        session.play("fade.san", 10, 0, 0);
        for k in 0..9u32 {
            assert_eq!(
                session.tick(u64::from(k) * 100).unwrap(),
                PresentationCommand::Present { frame: k }
            );
        }
        let palettes = &session.display().palettes;
        assert_eq!(palettes.len(), 9);
        assert!(palettes[0].1.iter().all(|&c| c == 200));
        assert!(palettes[8].1.iter().all(|&c| c == 0));
        // Monotonic fade
        for pair in palettes.windows(2) {
            assert!(pair[1].1[0] <= pair[0].1[0]);
        }
    }

    #[test]
    fn test_malformed_nested_chunk() {
        let mut bad = b"FOBJ".to_vec();
        bad.extend_from_slice(&1000u32.to_be_bytes());
        bad.extend_from_slice(&[0u8; 16]);
        let data = anim(&[ahdr(2, 2, &grey_palette(0)), frame(&[rle_fobj(4, 2, 1)]), frame(&[bad])]);
        let mut session = session_with(&[("bad.san", data)]);

        session.play("bad.san", 10, 0, 0);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 0 });
        let err = session.tick(100).unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Chunk(ChunkError::Oversized { size: 1000, available: 16, .. })
        ));
        assert_eq!(session.state(), PlaybackState::Aborted);
        assert_eq!(session.tick(200).unwrap(), PresentationCommand::Stopped);
        assert_eq!(session.display().frames.len(), 1);
    }

    #[test]
    fn test_unknown_top_level_tag() {
        let data = anim(&[ahdr(2, 1, &grey_palette(0)), chunk(b"JUNK", &[1, 2])]);
        let mut session = session_with(&[("junk.san", data)]);
        session.play("junk.san", 10, 0, 0);
        assert!(matches!(
            session.tick(0),
            Err(PlaybackError::Chunk(ChunkError::UnknownTag { .. }))
        ));
    }

    #[test]
    fn test_seek_into_middle_uses_resume_frame() {
        let data = numbered_container(45);
        let offset = frame_offset(&data, 40);
        let mut session = session_with(&[("loop.san", data)]);

        session.play("loop.san", 10, offset, 40);
        assert_eq!(session.tick(1000).unwrap(), PresentationCommand::Present { frame: 40 });
        assert_eq!(session.tick(1050).unwrap(), PresentationCommand::Wait);
        assert_eq!(session.tick(1100).unwrap(), PresentationCommand::Present { frame: 41 });
        assert_eq!(session.display().frames.last().unwrap(), &vec![42; 8]);

        // Header palette was loaded without an upload
        assert!(session.display().palettes.is_empty());
        assert_eq!(session.palette().entry(0), [50, 50, 50]);
        assert_eq!(session.header().unwrap().frame_count, 45);
    }

    #[test]
    fn test_loop_in_place_suppresses_header_palette() {
        let mut session = session_with(&[("loop.san", numbered_container(2))]);
        session.play("loop.san", 10, 0, 0);
        session.tick(0).unwrap();
        session.tick(100).unwrap();
        assert_eq!(session.display().palettes.len(), 1);

        session.seek(None, 0, 0);
        assert_eq!(session.tick(5000).unwrap(), PresentationCommand::Present { frame: 0 });
        assert_eq!(session.tick(5100).unwrap(), PresentationCommand::Present { frame: 1 });
        assert_eq!(session.display().palettes.len(), 1);
        assert_eq!(session.display().frames.len(), 4);
        assert_eq!(session.stats().seeks, 2);
    }

    #[test]
    fn test_seek_without_container() {
        let mut session = session_with(&[]);
        session.seek(None, 0, 0);
        assert!(matches!(session.tick(0), Err(PlaybackError::NoContainer)));
    }

    #[test]
    fn test_missing_container() {
        let mut session = session_with(&[]);
        session.play("nope.san", 10, 0, 0);
        assert!(matches!(session.tick(0), Err(PlaybackError::Open { .. })));
    }

    #[test]
    fn test_join_without_header() {
        let headless = anim(&[frame(&[rle_fobj(4, 2, 1)]), frame(&[rle_fobj(4, 2, 2)])]);
        let second = frame(&[rle_fobj(4, 2, 1)]).len() as u64;
        let mut session = session_with(&[("headless.san", headless)]);
        session.play("headless.san", 10, second, 1);
        match session.tick(0) {
            Err(PlaybackError::MissingHeader(name)) => assert_eq!(name, "headless.san"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_skip_streak_forces_presentation() {
        let mut session = session_with(&[("slow.san", numbered_container(30))]);
        session.play("slow.san", 10, 0, 0);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 0 });

        // Far behind: every frame is skippable
        let results: Vec<_> = (0..22).map(|_| session.tick(60_000).unwrap()).collect();
        for (i, r) in results.iter().enumerate() {
            let frame = i as u32 + 1;
            if i == 10 || i == 21 {
                assert_eq!(*r, PresentationCommand::Present { frame });
            } else {
                assert_eq!(*r, PresentationCommand::Skip { frame });
            }
        }
        assert_eq!(session.stats().skipped, 20);
        assert_eq!(session.stats().decoded, 23);
    }

    #[test]
    fn test_palette_change_deferred_while_skipping() {
        let data = anim(&[
            ahdr(2, 4, &grey_palette(9)),
            frame(&[rle_fobj(4, 2, 1)]),
            frame(&[chunk(b"NPAL", &grey_palette(77)), rle_fobj(4, 2, 2)]),
            frame(&[rle_fobj(4, 2, 3)]),
        ]);
        let mut session = session_with(&[("pal.san", data)]);
        session.play("pal.san", 10, 0, 0);
        session.tick(0).unwrap();
        assert_eq!(session.tick(200).unwrap(), PresentationCommand::Skip { frame: 1 });
        assert_eq!(session.display().palettes.len(), 1);

        assert_eq!(session.tick(200).unwrap(), PresentationCommand::Present { frame: 2 });
        assert_eq!(session.display().palettes.len(), 2);
        assert_eq!(session.display().palettes[1].1, vec![77; 768]);
    }

    #[test]
    fn test_fade_behind_clock_still_skips() {
        let mut parts = vec![
            ahdr(2, 26, &grey_palette(200)),
            frame(&[xpal_set(-200, &grey_palette(200)), rle_fobj(4, 2, 1)]),
        ];
        parts.extend((0..25).map(|_| frame(&[xpal_apply(), rle_fobj(4, 2, 1)])));
        let mut session = session_with(&[("fade.san", anim(&parts))]);
        session.play("fade.san", 10, 0, 0);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 0 });

        let results: Vec<_> = (0..20).map(|_| session.tick(60_000).unwrap()).collect();
        for (i, r) in results.iter().enumerate() {
            let frame = i as u32 + 1;
            if i == 10 {
                assert_eq!(*r, PresentationCommand::Present { frame });
            } else {
                assert_eq!(*r, PresentationCommand::Skip { frame });
            }
        }
        assert_eq!(session.stats().skipped, 19);
        assert_eq!(session.stats().palette_flushes, 2);

        // The one upload during catch-up carries the accumulated fade
        let palettes = &session.display().palettes;
        assert!(palettes[1].1.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_psad_audio_reaches_mixer() {
        let samples: Vec<u8> = (0..200u8).collect();
        let tree = saud_tree(&samples);
        let (a, b) = tree.split_at(100);
        let data = anim(&[
            ahdr(2, 3, &grey_palette(0)),
            frame(&[psad(4, 0, 2, 0, 100, 0, a), rle_fobj(4, 2, 1)]),
            frame(&[psad(4, 1, 2, 0, 100, 0, b), rle_fobj(4, 2, 1)]),
            frame(&[rle_fobj(4, 2, 1)]),
        ]);
        let mut session = session_with(&[("talk.san", data)]);
        session.play("talk.san", 10, 0, 0);
        for k in 0..3 {
            session.tick(k * 100).unwrap();
        }

        let mixer = session.mixer();
        assert_eq!(mixer.streams.len(), 1);
        let stream = mixer.streams.values().next().unwrap();
        assert_eq!(stream.queued_total(), 200);
        assert!(stream.is_finished());
    }

    #[test]
    fn test_psad_out_of_order_is_fatal() {
        let tree = saud_tree(&[1, 2, 3, 4]);
        let data = anim(&[
            ahdr(2, 2, &grey_palette(0)),
            frame(&[psad(4, 0, 3, 0, 100, 0, &tree[..20])]),
            frame(&[psad(4, 2, 3, 0, 100, 0, &tree[20..])]),
        ]);
        let mut session = session_with(&[("bad.san", data)]);
        session.play("bad.san", 10, 0, 0);
        session.tick(0).unwrap();
        assert!(matches!(
            session.tick(100),
            Err(PlaybackError::Audio(AudioError::IndexMismatch { expected: 1, got: 2, .. }))
        ));
    }

    #[test]
    fn test_interleaved_seek_into_split_block() {
        let mut block = 2049u16.to_be_bytes().to_vec();
        block.push(0);
        block.extend(std::iter::repeat(1).take(2048));
        let (head, tail) = block.split_at(1000);
        let data = anim(&[
            ahdr(2, 2, &grey_palette(0)),
            frame(&[iact(0, 0, 0, 0, head), rle_fobj(4, 2, 1)]),
            frame(&[iact(0, 0, 0, 0, tail), rle_fobj(4, 2, 2)]),
        ]);
        let offset = frame_offset(&data, 1);
        let config = PlaybackConfig {
            audio_layout: AudioLayout::Interleaved,
            ..small_config()
        };
        let make = |data: &[u8]| {
            let mut assets = MemoryAssets::new();
            assets.insert("split.san", data.to_vec());
            let session: Session =
                PlaybackSession::new(RecordingDisplay::default(), TestMixer::default(), Box::new(assets), config.clone());
            session
        };

        // From the start the block decodes whole
        let mut session = make(&data);
        session.play("split.san", 10, 0, 0);
        session.tick(0).unwrap();
        session.tick(100).unwrap();
        let stream = session.mixer().streams.values().next().unwrap();
        assert_eq!(stream.queued_total(), 4096);

        // Joining at frame 1 lands inside the block
        let mut session = make(&data);
        session.play("split.san", 10, offset, 1);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 1 });
        assert_eq!(session.tick(100).unwrap(), PresentationCommand::Finished);
        assert!(session.mixer().streams.is_empty());
    }

    #[test]
    fn test_compressed_audio_drives_clock() {
        let data = anim(&[
            ahdr(2, 3, &grey_palette(0)),
            frame(&[psad(4, 0, 1, 0, 100, 0, &saud_tree(&[1, 2])), rle_fobj(4, 2, 1)]),
            frame(&[rle_fobj(4, 2, 2)]),
            frame(&[rle_fobj(4, 2, 3)]),
        ]);
        let mut session = session_with(&[("music.san", data), ("music.ogg", vec![0u8; 4])]);
        session.play("music.san", 10, 0, 0);

        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 0 });
        // PSAD ignored while side audio plays
        assert!(session.mixer().streams.is_empty());

        // Wall clock says late, audio clock says early
        session.mixer_mut().compressed_ms = 50;
        assert_eq!(session.tick(5000).unwrap(), PresentationCommand::Wait);
        session.mixer_mut().compressed_ms = 100;
        assert_eq!(session.tick(5000).unwrap(), PresentationCommand::Present { frame: 1 });
    }

    #[test]
    fn test_stop_handle_tears_down() {
        let mut session = session_with(&[("a.san", numbered_container(5)), ("a.ogg", vec![1])]);
        session.play("a.san", 10, 0, 0);
        session.tick(0).unwrap();
        let compressed = session.mixer().compressed.unwrap();

        session.stop_handle().stop();
        assert_eq!(session.tick(100).unwrap(), PresentationCommand::Stopped);
        assert_eq!(session.state(), PlaybackState::Aborted);
        assert!(session.mixer().stopped.contains(&compressed));
        assert_eq!(session.tick(200).unwrap(), PresentationCommand::Stopped);
    }

    #[test]
    fn test_skip_chunk_consults_condition_bits() {
        let skip = |par1: u16, par2: u16| {
            let mut p = par1.to_le_bytes().to_vec();
            p.extend_from_slice(&par2.to_le_bytes());
            chunk(b"SKIP", &p)
        };
        let data = anim(&[
            ahdr(2, 4, &grey_palette(0)),
            frame(&[rle_fobj(4, 2, 1)]),
            frame(&[skip(3, 0), rle_fobj(4, 2, 2)]),
            frame(&[skip(3, 4), rle_fobj(4, 2, 3)]),
            frame(&[skip(4, 5), rle_fobj(4, 2, 4)]),
        ]);
        let mut session = session_with(&[("cond.san", data)]);
        session.set_condition_bit(3, true);
        session.play("cond.san", 10, 0, 0);
        for k in 0..4 {
            session.tick(k * 100).unwrap();
        }
        // Bit 3 set skips frames 1 and 2 (bits differ); bits 4 and 5 agree
        assert_eq!(
            session.display().frames,
            vec![vec![1; 8], vec![1; 8], vec![1; 8], vec![4; 8]]
        );
    }

    #[test]
    fn test_iact_track_reaches_mixer() {
        let samples = vec![0x80u8; 64];
        let data = anim(&[
            ahdr(2, 2, &grey_palette(0)),
            frame(&[iact(1, 2, 0, 1, &imus_tree(8, 11025, 1, &samples)), rle_fobj(4, 2, 1)]),
            frame(&[rle_fobj(4, 2, 1)]),
        ]);
        let mut session = session_with(&[("iact.san", data)]);
        session.play("iact.san", 10, 0, 0);
        session.tick(0).unwrap();
        session.tick(100).unwrap();

        let stream = session.mixer().streams.values().next().unwrap();
        assert_eq!(stream.format().rate, 11025);
        assert_eq!(stream.queued_total(), 64);
        assert!(stream.is_finished());
    }

    #[test]
    fn test_iact_mid_track_segment_dropped() {
        let data = anim(&[
            ahdr(2, 1, &grey_palette(0)),
            frame(&[iact(1, 2, 3, 5, &[1, 2, 3, 4]), rle_fobj(4, 2, 1)]),
        ]);
        let mut session = session_with(&[("late.san", data)]);
        session.play("late.san", 10, 0, 0);
        assert_eq!(session.tick(0).unwrap(), PresentationCommand::Present { frame: 0 });
        assert!(session.mixer().streams.is_empty());
    }

    #[test]
    fn test_store_and_fetch_frames() {
        let data = anim(&[
            ahdr(2, 3, &grey_palette(0)),
            frame(&[chunk(b"STOR", &[0; 4]), rle_fobj(4, 2, 5)]),
            frame(&[rle_fobj(4, 2, 6)]),
            frame(&[chunk(b"FTCH", &[0; 6])]),
        ]);
        let mut session = session_with(&[("store.san", data)]);
        session.play("store.san", 10, 0, 0);
        for k in 0..3 {
            session.tick(k * 100).unwrap();
        }
        assert_eq!(session.display().frames, vec![vec![5; 8], vec![6; 8], vec![5; 8]]);
    }

    #[test]
    fn test_text_drawn_into_frame() {
        let mut config = small_config();
        config.screen_width = 32;
        config.screen_height = 16;
        let data = anim(&[
            ahdr(2, 1, &grey_palette(0)),
            frame(&[
                rle_fobj(32, 16, 1),
                chunk(b"TEXT", &TextBox::at(0, 0).inline_payload("^c009A")),
            ]),
        ]);
        let mut assets = MemoryAssets::new();
        assets.insert("text.san", data);
        let mut session: Session =
            PlaybackSession::new(RecordingDisplay::default(), TestMixer::default(), Box::new(assets), config);
        session.play("text.san", 10, 0, 0);
        session.tick(0).unwrap();

        let shown = &session.display().frames[0];
        assert_eq!(shown[0], 9);
        assert_eq!(shown[31], 1);
    }

    #[test]
    fn test_pause_holds_frames() {
        let mut session = session_with(&[("p.san", numbered_container(3))]);
        session.play("p.san", 10, 0, 0);
        session.tick(0).unwrap();
        session.pause(50);
        assert_eq!(session.tick(500).unwrap(), PresentationCommand::Wait);
        session.resume(1000);
        assert_eq!(session.tick(1049).unwrap(), PresentationCommand::Wait);
        assert_eq!(session.tick(1050).unwrap(), PresentationCommand::Present { frame: 1 });
    }
}
