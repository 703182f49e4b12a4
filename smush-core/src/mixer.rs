//! # Channel Registry - Audio Tracks to Mixer Streams
//!
//! Live channels are pumped once per decoded frame. Ready PCM moves into a
//! [`PcmStream`] that the host audio thread drains on its own schedule.
//!
//! ```text
//! ┌──────────┐  pump()  ┌───────────┐  read()  ┌────────────┐
//! │ Channels │─────────►│ PcmStream │─────────►│ Host mixer │
//! │ (decode) │          │ (queue)   │          │ thread     │
//! └──────────┘          └───────────┘          └────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{AudioChannel, PcmFormat};
use crate::host::{AudioMixer, SoundHandle};

pub const DEFAULT_MAX_CHANNELS: usize = 16;

// ============================================================================
// PCM Stream
// ============================================================================

#[derive(Debug)]
struct StreamShared {
    /// Queued, not yet consumed sample bytes
    queue: Mutex<VecDeque<u8>>,

    /// Total bytes ever queued
    queued_total: AtomicU64,

    /// Total bytes handed to the reader
    consumed: AtomicU64,

    /// No more data will be queued
    finished: AtomicBool,
}

/// PCM queue shared between the control thread and the host audio thread.
#[derive(Debug, Clone)]
pub struct PcmStream {
    format: PcmFormat,
    shared: Arc<StreamShared>,
}

impl PcmStream {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            shared: Arc::new(StreamShared {
                queue: Mutex::new(VecDeque::with_capacity(16 * 1024)),
                queued_total: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    // ========================================================================
    // Producer API (control thread)
    // ========================================================================

    pub fn queue(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut queue = self.shared.queue.lock();
        queue.extend(data.iter().copied());
        self.shared.queued_total.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.shared.finished.store(true, Ordering::Release);
    }

    // ========================================================================
    // Consumer API (audio thread)
    // ========================================================================

    /// Drains up to `out.len()` bytes, returning how many were written.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut queue = self.shared.queue.lock();
        let n = out.len().min(queue.len());
        for (slot, byte) in out.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        self.shared.consumed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Finished and fully consumed.
    pub fn is_drained(&self) -> bool {
        self.is_finished() && self.shared.queue.lock().is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn queued_total(&self) -> u64 {
        self.shared.queued_total.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.shared.consumed.load(Ordering::Relaxed)
    }

    /// Playback position implied by consumed bytes.
    pub fn played_ms(&self) -> u64 {
        self.format.bytes_to_ms(self.consumed())
    }
}

// ============================================================================
// Channel Registry
// ============================================================================

struct Slot {
    channel: AudioChannel,
    stream: Option<(PcmStream, SoundHandle)>,
}

/// Live audio channels keyed by track id.
pub struct ChannelRegistry {
    slots: Vec<Slot>,
    max_channels: usize,
}

impl ChannelRegistry {
    pub fn new(max_channels: usize) -> Self {
        Self {
            slots: Vec::with_capacity(max_channels),
            max_channels,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn find_mut(&mut self, track: u32) -> Option<&mut AudioChannel> {
        self.slots
            .iter_mut()
            .find(|s| s.channel.track() == track)
            .map(|s| &mut s.channel)
    }

    /// Existing channel for `track`, or a new one from `make`.
    /// `None` when the registry is full.
    pub fn get_or_create(
        &mut self,
        track: u32,
        make: impl FnOnce() -> AudioChannel,
    ) -> Option<&mut AudioChannel> {
        let index = match self.slots.iter().position(|s| s.channel.track() == track) {
            Some(i) => i,
            None => {
                if self.slots.len() >= self.max_channels {
                    tracing::warn!(
                        "All {} audio channels busy, dropping segment for track {}",
                        self.max_channels,
                        track
                    );
                    return None;
                }
                tracing::debug!("Opening audio channel for track {}", track);
                self.slots.push(Slot {
                    channel: make(),
                    stream: None,
                });
                self.slots.len() - 1
            }
        };
        Some(&mut self.slots[index].channel)
    }

    /// Mixer handle playing `track`, once its stream has started.
    pub fn handle(&self, track: u32) -> Option<SoundHandle> {
        self.slots
            .iter()
            .find(|s| s.channel.track() == track)
            .and_then(|s| s.stream.as_ref().map(|(_, h)| *h))
    }

    /// Moves ready audio of every channel to the mixer; retires finished ones.
    pub fn pump<M: AudioMixer + ?Sized>(&mut self, mixer: &mut M) {
        self.slots.retain_mut(|slot| {
            if slot.channel.is_done() {
                if let Some((stream, _)) = slot.stream.take() {
                    stream.finish();
                }
                tracing::debug!("Audio track {} finished", slot.channel.track());
                return false;
            }

            let data = slot.channel.take_ready_data();
            if data.is_empty() {
                return true;
            }
            if slot.stream.is_none() {
                let Some(format) = slot.channel.format() else {
                    return true;
                };
                let stream = PcmStream::new(format);
                let handle = mixer.play_stream(stream.clone());
                slot.stream = Some((stream, handle));
            }
            if let Some((stream, handle)) = &slot.stream {
                mixer.set_volume_pan(*handle, slot.channel.volume(), slot.channel.pan());
                stream.queue(&data);
            }
            true
        });
    }

    /// Stops every playing handle and forgets all channels. Returns the
    /// audio bytes cut off: ready output plus declared data never received.
    pub fn stop_all<M: AudioMixer + ?Sized>(&mut self, mixer: &mut M) -> usize {
        let mut cut = 0;
        for slot in self.slots.drain(..) {
            let owed = slot.channel.owed_bytes();
            if owed > 0 {
                tracing::debug!("Stopping audio track {} with {} bytes outstanding", slot.channel.track(), owed);
            }
            cut += owed;
            if let Some((stream, handle)) = slot.stream {
                stream.finish();
                mixer.stop_handle(handle);
            }
        }
        cut
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHANNELS)
    }
}

// ============================================================================
// Tests
// ============================================================================
