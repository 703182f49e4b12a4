//! Host services the engine drives: the framebuffer, the audio mixer and
//! the asset store. Implementations live in the embedding application.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::mixer::PcmStream;

/// Paletted framebuffer.
pub trait Display {
    /// Uploads `rgb.len() / 3` colours starting at entry `first`.
    fn set_palette(&mut self, first: usize, rgb: &[u8]);

    /// Copies a `width × height` block of indexed pixels to `(x, y)`.
    fn copy_rect(&mut self, pixels: &[u8], pitch: usize, x: usize, y: usize, width: usize, height: usize);

    /// Shows what has been copied since the last call.
    fn present(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoundHandle(pub u32);

pub trait AudioMixer {
    /// Starts consuming a PCM queue. The stream ends once it is finished and drained.
    fn play_stream(&mut self, stream: PcmStream) -> SoundHandle;

    /// Starts a compressed side-audio file, or `None` if the format is unsupported.
    fn play_compressed(&mut self, name: &str, data: Bytes) -> Option<SoundHandle>;

    fn stop_handle(&mut self, handle: SoundHandle);

    /// Milliseconds played on `handle`, if the mixer tracks it.
    fn elapsed_ms(&self, handle: SoundHandle) -> Option<u64>;

    fn is_active(&self, handle: SoundHandle) -> bool;

    fn set_volume_pan(&mut self, handle: SoundHandle, volume: u8, pan: i8);
}

/// Mixer with no output device. Streams are accepted and never consumed.
#[derive(Debug, Default)]
pub struct NullMixer {
    next: u32,
    streams: HashMap<SoundHandle, PcmStream>,
}

impl NullMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self, handle: SoundHandle) -> Option<&PcmStream> {
        self.streams.get(&handle)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl AudioMixer for NullMixer {
    fn play_stream(&mut self, stream: PcmStream) -> SoundHandle {
        self.next += 1;
        let handle = SoundHandle(self.next);
        self.streams.insert(handle, stream);
        handle
    }

    fn play_compressed(&mut self, name: &str, _data: Bytes) -> Option<SoundHandle> {
        tracing::debug!("No compressed audio support, ignoring {}", name);
        None
    }

    fn stop_handle(&mut self, handle: SoundHandle) {
        self.streams.remove(&handle);
    }

    fn elapsed_ms(&self, _handle: SoundHandle) -> Option<u64> {
        None
    }

    fn is_active(&self, _handle: SoundHandle) -> bool {
        false
    }

    fn set_volume_pan(&mut self, _handle: SoundHandle, _volume: u8, _pan: i8) {}
}

// ============================================================================
// Assets
// ============================================================================

pub trait AssetSource {
    fn open(&self, name: &str) -> io::Result<Bytes>;

    fn exists(&self, name: &str) -> bool {
        self.open(name).is_ok()
    }
}

/// Assets read from one directory on disk.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl AssetSource for DirectoryAssets {
    fn open(&self, name: &str) -> io::Result<Bytes> {
        std::fs::read(self.resolve(name)).map(Bytes::from)
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }
}

/// In-memory assets keyed by name.
#[derive(Debug, Default, Clone)]
pub struct MemoryAssets {
    files: HashMap<String, Bytes>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(name.into(), data.into());
    }
}

impl AssetSource for MemoryAssets {
    fn open(&self, name: &str) -> io::Result<Bytes> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

/// Candidate side-audio names for `container`, e.g. `intro.san` -> `intro.ogg`.
pub fn side_audio_candidates(container: &str, extensions: &[String]) -> Vec<String> {
    let stem = match container.rfind('.') {
        Some(dot) if !container[dot..].contains('/') => &container[..dot],
        _ => container,
    };
    extensions.iter().map(|ext| format!("{}.{}", stem, ext)).collect()
}
