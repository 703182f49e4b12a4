//! Frame Clock & Scheduler
//!
//! Audio is the master clock when a stream reports its position; wall time
//! since the last seek (minus pauses) otherwise. All times are milliseconds
//! supplied by the caller, so the scheduler is deterministic under test.

/// What to do with the next frame at a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Not due yet
    Wait,
    /// Due; `skippable` when the clock is already a frame past it
    Decode { skippable: bool },
}

/// Where the elapsed time came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    CompressedAudio,
    InterleavedAudio,
    Wall,
}

/// Frame clock, restarted on every seek
#[derive(Debug, Clone)]
pub struct FrameClock {
    fps: u32,
    start_frame: u32,
    start_ms: u64,
    paused_total: u64,
    paused_at: Option<u64>,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            start_frame: 0,
            start_ms: 0,
            paused_total: 0,
            paused_at: None,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.fps = fps.max(1);
    }

    pub fn start_frame(&self) -> u32 {
        self.start_frame
    }

    /// New pacing baseline: `start_frame` is due at `now_ms`.
    pub fn restart(&mut self, now_ms: u64, start_frame: u32) {
        self.start_frame = start_frame;
        self.start_ms = now_ms;
        self.paused_total = 0;
        self.paused_at = None;
    }

    pub fn pause(&mut self, now_ms: u64) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now_ms);
        }
    }

    pub fn resume(&mut self, now_ms: u64) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += now_ms.saturating_sub(at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Wall time since the last restart, pauses excluded.
    pub fn wall_elapsed(&self, now_ms: u64) -> u64 {
        let running_pause = self.paused_at.map_or(0, |at| now_ms.saturating_sub(at));
        now_ms
            .saturating_sub(self.start_ms)
            .saturating_sub(self.paused_total + running_pause)
    }

    /// Elapsed time from the first available source.
    pub fn elapsed(&self, now_ms: u64, compressed: Option<u64>, interleaved: Option<u64>) -> (u64, ClockSource) {
        if let Some(ms) = compressed {
            (ms, ClockSource::CompressedAudio)
        } else if let Some(ms) = interleaved {
            (ms, ClockSource::InterleavedAudio)
        } else {
            (self.wall_elapsed(now_ms), ClockSource::Wall)
        }
    }

    /// Time after the baseline at which `frame` is due.
    pub fn due_ms(&self, frame: u32) -> u64 {
        u64::from(frame.saturating_sub(self.start_frame)) * 1000 / u64::from(self.fps)
    }

    pub fn decide(&self, frame: u32, elapsed_ms: u64) -> FrameDecision {
        if elapsed_ms < self.due_ms(frame) {
            return FrameDecision::Wait;
        }
        FrameDecision::Decode {
            skippable: elapsed_ms >= self.due_ms(frame + 1),
        }
    }
}

/// Consecutive skip counter
#[derive(Debug, Clone)]
pub struct SkipTracker {
    streak: u32,
    limit: u32,
}

impl SkipTracker {
    pub fn new(limit: u32) -> Self {
        Self { streak: 0, limit }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }

    /// Returns whether the decoded frame is presented. Once the streak
    /// exceeds the limit the frame is shown anyway.
    pub fn resolve(&mut self, skippable: bool) -> bool {
        if !skippable {
            self.streak = 0;
            return true;
        }
        self.streak += 1;
        if self.streak > self.limit {
            self.streak = 0;
            return true;
        }
        false
    }

    /// A palette upload clears the streak; it does not change the current decision.
    pub fn palette_flushed(&mut self) {
        self.streak = 0;
    }
}

impl Default for SkipTracker {
    fn default() -> Self {
        Self::new(10)
    }
}
