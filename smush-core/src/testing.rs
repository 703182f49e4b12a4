//! Builders for synthetic SMUSH containers used across the test modules.

/// One chunk: tag, big-endian size, payload, pad byte when odd.
pub fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = tag.to_vec();
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
    out
}

pub fn anim(parts: &[Vec<u8>]) -> Vec<u8> {
    chunk(b"ANIM", &parts.concat())
}

pub fn frame(parts: &[Vec<u8>]) -> Vec<u8> {
    chunk(b"FRME", &parts.concat())
}

pub fn ahdr(version: u16, frame_count: u16, palette: &[u8; 768]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(0x306);
    payload.extend_from_slice(&version.to_le_bytes());
    payload.extend_from_slice(&frame_count.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(palette);
    chunk(b"AHDR", &payload)
}

/// One RLE line made of literal runs.
pub fn rle_literal(pixels: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for run in pixels.chunks(128) {
        body.push(((run.len() - 1) << 1) as u8);
        body.extend_from_slice(run);
    }
    let mut line = (body.len() as u16).to_le_bytes().to_vec();
    line.extend_from_slice(&body);
    line
}

pub fn fobj_payload(codec: u16, left: i16, top: i16, width: u16, height: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&codec.to_le_bytes());
    payload.extend_from_slice(&left.to_le_bytes());
    payload.extend_from_slice(&top.to_le_bytes());
    payload.extend_from_slice(&width.to_le_bytes());
    payload.extend_from_slice(&height.to_le_bytes());
    payload.extend_from_slice(&[0u8; 4]);
    payload.extend_from_slice(data);
    payload
}

/// Full-surface codec 1 object stored uncompressed.
pub fn raw_fobj(width: u16, height: u16, pixels: &[u8]) -> Vec<u8> {
    chunk(b"FOBJ", &fobj_payload(1, 0, 0, width, height, pixels))
}

/// Full-surface codec 1 object filled with one colour.
pub fn rle_fobj(width: u16, height: u16, color: u8) -> Vec<u8> {
    let line = rle_literal(&vec![color; width as usize]);
    let data: Vec<u8> = (0..height).flat_map(|_| line.iter().copied()).collect();
    chunk(b"FOBJ", &fobj_payload(1, 0, 0, width, height, &data))
}

pub fn xpal_set(deltas: i16, absolute: &[u8; 768]) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    for _ in 0..768 {
        payload.extend_from_slice(&deltas.to_le_bytes());
    }
    payload.extend_from_slice(absolute);
    chunk(b"XPAL", &payload)
}

pub fn xpal_apply() -> Vec<u8> {
    chunk(b"XPAL", &[0u8; 6])
}

pub fn psad(track: u16, index: u16, max_frames: u16, flags: u16, volume: u8, pan: i8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    for v in [track, index, max_frames, flags] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.push(volume);
    payload.push(pan as u8);
    payload.extend_from_slice(data);
    chunk(b"PSAD", &payload)
}

/// IACT audio chunk (`code = 8`, `flags = 46`).
pub fn iact(track_flags: u16, track_id: u16, index: u16, frame_count: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    for v in [8u16, 46, 0, track_flags, track_id, index, frame_count] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(data);
    chunk(b"IACT", &payload)
}

/// Big-endian audio sub-chunk (no padding).
pub fn audio_chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = tag.to_vec();
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// A complete SAUD tree around `samples`.
pub fn saud_tree(samples: &[u8]) -> Vec<u8> {
    let body = [
        audio_chunk(b"STRK", &[0u8; 0x14]),
        audio_chunk(b"SMRK", &[]),
        audio_chunk(b"SHDR", &[0u8; 4]),
        audio_chunk(b"SDAT", samples),
    ]
    .concat();
    let mut out = b"SAUD".to_vec();
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// A complete iMUS tree around already packed `samples`.
pub fn imus_tree(bits: u32, rate: u32, channels: u32, samples: &[u8]) -> Vec<u8> {
    let mut frmt = vec![0u8; 8];
    for v in [bits, rate, channels] {
        frmt.extend_from_slice(&v.to_be_bytes());
    }
    let map = [
        audio_chunk(b"FRMT", &frmt),
        audio_chunk(b"REGN", &[0u8; 8]),
        audio_chunk(b"STOP", &[0u8; 4]),
    ]
    .concat();
    let body = [audio_chunk(b"MAP ", &map), audio_chunk(b"DATA", samples)].concat();
    let mut out = b"iMUS".to_vec();
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

pub struct TextBox {
    pub x: i16,
    pub y: i16,
    pub flags: i16,
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub height: i16,
}

impl TextBox {
    pub fn at(x: i16, y: i16) -> Self {
        Self {
            x,
            y,
            flags: 0,
            left: 0,
            top: 0,
            right: 0,
            height: 0,
        }
    }

    fn header(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for v in [self.x, self.y, self.flags, self.left, self.top, self.right, self.height] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    pub fn inline_payload(&self, text: &str) -> Vec<u8> {
        let mut out = self.header();
        out.extend_from_slice(text.as_bytes());
        out.push(0);
        out
    }

    pub fn resource_payload(&self, id: u16) -> Vec<u8> {
        let mut out = self.header();
        out.extend_from_slice(&id.to_le_bytes());
        out
    }
}

pub fn grey_palette(level: u8) -> [u8; 768] {
    [level; 768]
}
