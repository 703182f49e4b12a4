//! Container probe: header, frame index and payload census without decoding.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::IactHeader;
use crate::chunk::{AnimHeader, ChunkError, SmushStream, Tag};
use crate::codec::{inflate_frame_object, DecodeError, FrameObject};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Container has no AHDR header")]
    MissingHeader,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioKind {
    None,
    /// `PSAD` segments
    Saud,
    /// `IACT` segments
    Iact,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmushInfo {
    pub version: u16,
    pub declared_frames: u16,
    pub frames: usize,
    pub body_len: u64,
    /// Frame objects per codec id
    pub codecs: BTreeMap<u16, usize>,
    pub max_width: u16,
    pub max_height: u16,
    pub audio: AudioKind,
    pub audio_tracks: Vec<u32>,
    pub text_chunks: usize,
    pub palette_updates: usize,
    /// Offset of every FRME relative to the ANIM payload
    #[serde(skip)]
    pub frame_offsets: Vec<u64>,
}

impl SmushInfo {
    /// Resume offset of frame `n`, as stored by game scripts.
    pub fn frame_offset(&self, n: usize) -> Option<u64> {
        self.frame_offsets.get(n).copied()
    }
}

pub fn probe(data: Bytes) -> Result<SmushInfo, ProbeError> {
    let mut stream = SmushStream::open(data)?;
    let body_len = stream.body_len();

    let mut header: Option<AnimHeader> = None;
    let mut info = SmushInfo {
        version: 0,
        declared_frames: 0,
        frames: 0,
        body_len,
        codecs: BTreeMap::new(),
        max_width: 0,
        max_height: 0,
        audio: AudioKind::None,
        audio_tracks: Vec::new(),
        text_chunks: 0,
        palette_updates: 0,
        frame_offsets: Vec::new(),
    };
    let (mut saud, mut iact) = (false, false);

    while let Some(top) = stream.next_chunk()? {
        match top.tag {
            Tag::AHDR => {
                if header.is_none() {
                    header = Some(AnimHeader::parse(&top)?);
                }
            }
            Tag::FRME => {
                info.frame_offsets.push(top.offset - 8);
                info.frames += 1;

                let mut subs = top.children();
                while let Some(sub) = subs.next_subchunk()? {
                    match sub.tag {
                        Tag::FOBJ | Tag::ZFOB => {
                            let payload = if sub.tag == Tag::ZFOB {
                                Bytes::from(inflate_frame_object(&sub.payload)?)
                            } else {
                                sub.payload.clone()
                            };
                            let (object, _) = FrameObject::parse(&payload, sub.data_offset())?;
                            *info.codecs.entry(object.codec).or_default() += 1;
                            info.max_width = info.max_width.max(object.width);
                            info.max_height = info.max_height.max(object.height);
                        }
                        Tag::PSAD => {
                            saud = true;
                            if let Some(track) = sub.payload.get(..2) {
                                let id = u32::from(u16::from_le_bytes([track[0], track[1]]));
                                if !info.audio_tracks.contains(&id) {
                                    info.audio_tracks.push(id);
                                }
                            }
                        }
                        Tag::IACT => {
                            let (iact_header, _) = IactHeader::parse(&sub.payload, sub.data_offset())?;
                            if iact_header.is_audio() {
                                iact = true;
                                if let Ok(id) = iact_header.channel_id() {
                                    if !info.audio_tracks.contains(&id) {
                                        info.audio_tracks.push(id);
                                    }
                                }
                            }
                        }
                        Tag::TEXT | Tag::TRES => info.text_chunks += 1,
                        Tag::NPAL | Tag::XPAL => info.palette_updates += 1,
                        Tag::STOR | Tag::FTCH | Tag::SKIP => {}
                        other => {
                            return Err(ChunkError::UnknownTag {
                                tag: other,
                                offset: sub.offset,
                            }
                            .into())
                        }
                    }
                }
            }
            other => {
                return Err(ChunkError::UnknownTag {
                    tag: other,
                    offset: top.offset,
                }
                .into())
            }
        }
    }

    let header = header.ok_or(ProbeError::MissingHeader)?;
    info.version = header.version;
    info.declared_frames = header.frame_count;
    info.audio = match (saud, iact) {
        (false, false) => AudioKind::None,
        (true, false) => AudioKind::Saud,
        (false, true) => AudioKind::Iact,
        (true, true) => AudioKind::Both,
    };
    info.audio_tracks.sort_unstable();

    tracing::debug!(
        "Probed SMUSH v{}: {} frames ({} declared), codecs {:?}",
        info.version,
        info.frames,
        info.declared_frames,
        info.codecs
    );
    Ok(info)
}

pub fn probe_json(data: Bytes) -> Result<serde_json::Value, ProbeError> {
    Ok(serde_json::to_value(probe(data)?)?)
}
