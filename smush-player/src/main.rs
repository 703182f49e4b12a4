//! # SMUSH Player
//!
//! Headless cutscene player: probes containers, plays them against the wall
//! clock and optionally dumps every presented frame as PNG and every audio
//! track as raw PCM.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use smush_core::channel::SampleFormat;
use smush_core::host::{AudioMixer, DirectoryAssets, Display, SoundHandle};
use smush_core::mixer::PcmStream;
use smush_core::player::{PlaybackSession, PresentationCommand};
use smush_core::probe::probe_json;
use smush_core::PlaybackConfig;

// ============================================================================
// Options
// ============================================================================

struct Options {
    input: PathBuf,
    probe: bool,
    fps: u32,
    offset: u64,
    start_frame: u32,
    dump: Option<PathBuf>,
    audio_dump: Option<PathBuf>,
    config: Option<PathBuf>,
    no_subtitles: bool,
    /// Advance a virtual clock instead of sleeping
    fast: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut input: Option<PathBuf> = None;
    let mut options = Options {
        input: PathBuf::new(),
        probe: false,
        fps: 0,
        offset: 0,
        start_frame: 0,
        dump: None,
        audio_dump: None,
        config: None,
        no_subtitles: false,
        fast: false,
    };

    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--input" | "-i" => {
                input = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--probe" => {
                options.probe = true;
                i += 1;
            }
            "--fps" => {
                let v = value(i, flag)?;
                options.fps = v.parse().with_context(|| format!("Invalid fps {}", v))?;
                i += 2;
            }
            "--offset" => {
                let v = value(i, flag)?;
                options.offset = v.parse().with_context(|| format!("Invalid offset {}", v))?;
                i += 2;
            }
            "--start-frame" => {
                let v = value(i, flag)?;
                options.start_frame = v.parse().with_context(|| format!("Invalid frame {}", v))?;
                i += 2;
            }
            "--dump" => {
                options.dump = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--audio-dump" => {
                options.audio_dump = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--config" => {
                options.config = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--no-subtitles" => {
                options.no_subtitles = true;
                i += 1;
            }
            "--fast" => {
                options.fast = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                // A bare argument is the input
                if input.is_none() && !other.starts_with('-') {
                    input = Some(PathBuf::from(other));
                } else {
                    tracing::warn!("Ignoring unknown argument {}", other);
                }
                i += 1;
            }
        }
    }

    options.input = input.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing required --input")
    })?;
    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  smush --input <file.san> [--probe] [--fps <n>] [--offset <bytes> --start-frame <n>]\n        [--dump <dir>] [--audio-dump <dir>] [--config <file.json>] [--no-subtitles] [--fast]\n"
    );
}

// ============================================================================
// Frame dumper
// ============================================================================

/// Display that converts each presented frame to RGB and optionally saves it.
struct FrameDumper {
    palette: [u8; 768],
    staged: Vec<u8>,
    width: usize,
    height: usize,
    out_dir: Option<PathBuf>,
    presented: u64,
    write_errors: u64,
}

impl FrameDumper {
    fn new(out_dir: Option<PathBuf>) -> Self {
        Self {
            palette: [0; 768],
            staged: Vec::new(),
            width: 0,
            height: 0,
            out_dir,
            presented: 0,
            write_errors: 0,
        }
    }

    fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.staged.len() * 3);
        for &index in &self.staged {
            let i = usize::from(index) * 3;
            rgb.extend_from_slice(&self.palette[i..i + 3]);
        }
        rgb
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let image = image::RgbImage::from_raw(self.width as u32, self.height as u32, self.to_rgb())
            .ok_or_else(|| anyhow::anyhow!("Frame buffer does not match {}x{}", self.width, self.height))?;
        let path = dir.join(format!("frame_{:05}.png", self.presented));
        image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

impl Display for FrameDumper {
    fn set_palette(&mut self, first: usize, rgb: &[u8]) {
        let start = first * 3;
        let end = (start + rgb.len()).min(self.palette.len());
        self.palette[start..end].copy_from_slice(&rgb[..end - start]);
    }

    fn copy_rect(&mut self, pixels: &[u8], pitch: usize, _x: usize, _y: usize, width: usize, height: usize) {
        self.staged.clear();
        for row in pixels.chunks(pitch).take(height) {
            self.staged.extend_from_slice(&row[..width.min(row.len())]);
        }
        self.width = width;
        self.height = height;
    }

    fn present(&mut self) {
        if let Some(dir) = &self.out_dir {
            if let Err(e) = self.save(dir) {
                self.write_errors += 1;
                tracing::warn!("{:#}", e);
            }
        }
        self.presented += 1;
    }
}

// ============================================================================
// Audio capture
// ============================================================================

/// Mixer that drains every stream into memory. Compressed side audio is not decoded.
#[derive(Default)]
struct CaptureMixer {
    next: u32,
    streams: BTreeMap<u32, (PcmStream, Vec<u8>)>,
}

impl CaptureMixer {
    fn drain(&mut self) {
        let mut buf = [0u8; 4096];
        for (stream, captured) in self.streams.values_mut() {
            loop {
                let n = stream.read(&mut buf);
                if n == 0 {
                    break;
                }
                captured.extend_from_slice(&buf[..n]);
            }
        }
    }

    fn write_all(&mut self, dir: &Path) -> Result<()> {
        self.drain();
        std::fs::create_dir_all(dir)?;
        for (handle, (stream, captured)) in &self.streams {
            let format = stream.format();
            let sample = match format.sample {
                SampleFormat::U8 => "u8",
                SampleFormat::S16Be => "s16be",
            };
            let path = dir.join(format!(
                "track_{:03}_{}hz_{}ch_{}.pcm",
                handle, format.rate, format.channels, sample
            ));
            std::fs::write(&path, captured).with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote {} ({} bytes)", path.display(), captured.len());
        }
        Ok(())
    }
}

impl AudioMixer for CaptureMixer {
    fn play_stream(&mut self, stream: PcmStream) -> SoundHandle {
        self.next += 1;
        self.streams.insert(self.next, (stream, Vec::new()));
        SoundHandle(self.next)
    }

    fn play_compressed(&mut self, name: &str, _data: Bytes) -> Option<SoundHandle> {
        tracing::info!("Compressed audio {} found but not decoded, using frame clock", name);
        None
    }

    fn stop_handle(&mut self, handle: SoundHandle) {
        if let Some((stream, _)) = self.streams.get(&handle.0) {
            stream.finish();
        }
    }

    fn elapsed_ms(&self, handle: SoundHandle) -> Option<u64> {
        self.streams.get(&handle.0).map(|(s, _)| s.played_ms())
    }

    fn is_active(&self, _handle: SoundHandle) -> bool {
        // Captured streams are drained instantly and cannot pace video
        false
    }

    fn set_volume_pan(&mut self, _handle: SoundHandle, _volume: u8, _pan: i8) {}
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("smush=info,smush_core=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    if options.probe {
        let data = std::fs::read(&options.input)
            .with_context(|| format!("Failed to read {}", options.input.display()))?;
        let info = probe_json(Bytes::from(data))?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    run(&options)
}

fn run(options: &Options) -> Result<()> {
    tracing::info!("SMUSH Player v{}", smush_core::VERSION);

    let mut config = match &options.config {
        Some(path) => PlaybackConfig::from_json_file(path)?,
        None => PlaybackConfig::default(),
    };
    if options.no_subtitles {
        config.subtitles = false;
    }

    let root = options
        .input
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = options
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid input path {:?}", options.input))?
        .to_string();

    let fps = if options.fps == 0 { config.default_fps } else { options.fps };
    let frame_ms = 1000 / u64::from(fps);

    if let Some(dir) = &options.dump {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let display = FrameDumper::new(options.dump.clone());
    let mut session = PlaybackSession::new(
        display,
        CaptureMixer::default(),
        Box::new(DirectoryAssets::new(root)),
        config,
    );
    session.play(&name, fps, options.offset, options.start_frame);

    let started = Instant::now();
    let mut virtual_ms = 0u64;

    loop {
        let now = if options.fast {
            virtual_ms
        } else {
            started.elapsed().as_millis() as u64
        };
        let command = session.tick(now)?;
        session.mixer_mut().drain();

        match command {
            PresentationCommand::Present { .. } | PresentationCommand::Skip { .. } => {}
            PresentationCommand::Wait => {
                if options.fast {
                    virtual_ms += frame_ms;
                } else {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            PresentationCommand::Finished | PresentationCommand::Stopped | PresentationCommand::Idle => break,
        }
    }

    if let Some(dir) = &options.audio_dump {
        session.mixer_mut().write_all(dir)?;
    }

    let stats = session.stats();
    tracing::info!(
        "Playback complete: decoded={}, presented={}, skipped={}, palette_flushes={}, elapsed_ms={}",
        stats.decoded,
        stats.presented,
        stats.skipped,
        stats.palette_flushes,
        started.elapsed().as_millis()
    );
    if session.display().write_errors > 0 {
        tracing::warn!("{} frames could not be written", session.display().write_errors);
    }
    Ok(())
}
