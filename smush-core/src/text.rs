//! Text Overlay Renderer
//!
//! `TEXT` chunks carry their string inline; `TRES` chunks name an entry in
//! the container's companion string table. Strings may start with `/`
//! padding and carry `^fNN` (font) and `^cNNN` (colour) directives.

use std::collections::HashMap;

use thiserror::Error;

use crate::chunk::{ChunkError, FieldReader, Tag};
use crate::codec::Surface;

pub const DEFAULT_FONT: u8 = 0;
pub const DEFAULT_COLOR: u8 = 15;

/// Flag bit: centre each line on `x`.
pub const FLAG_CENTER: i16 = 1;
/// Flag bit: wrap inside the box; the text is a subtitle.
pub const FLAG_WRAP: i16 = 8;

#[derive(Debug, Error)]
pub enum TextError {
    #[error("Invalid escape code in text string {0:?}")]
    BadEscape(String),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

// ============================================================================
// String Table
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StringTable {
    entries: HashMap<u32, String>,
}

impl StringTable {
    /// Parses a resource file, decoding the `ETRS` wrapper if present.
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.len() >= 16 && &data[..4] == b"ETRS" {
            let decoded: Vec<u8> = data[16..].iter().map(|b| b ^ 0xCC).collect();
            return Self::parse(&latin1(&decoded));
        }
        Self::parse(&latin1(data))
    }

    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        let mut lines = content.lines().map(|l| l.trim_end_matches('\r')).peekable();

        while let Some(line) = lines.next() {
            if !line.starts_with('#') {
                continue;
            }
            let Some(id) = trailing_number(line) else {
                tracing::debug!("String table header without id: {:?}", line);
                continue;
            };

            let mut body: Vec<String> = Vec::new();
            while let Some(next) = lines.peek() {
                if next.trim().is_empty() || next.starts_with('#') {
                    break;
                }
                let next = lines.next().unwrap_or_default();
                match (next.strip_prefix("//"), body.last_mut()) {
                    (Some(rest), Some(prev)) => {
                        prev.push(' ');
                        prev.push_str(rest);
                    }
                    (Some(rest), None) => body.push(rest.to_string()),
                    (None, _) => body.push(next.to_string()),
                }
            }
            entries.insert(id, body.join("\n"));
        }

        Self { entries }
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// The last run of digits on the line; anything after it is ignored.
fn trailing_number(line: &str) -> Option<u32> {
    let end = line.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = line[..end]
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(0, |(i, c)| i + c.len_utf8());
    line[start..end].parse().ok()
}

// ============================================================================
// Text Chunks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextSource {
    Inline(String),
    Resource(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub x: i16,
    pub y: i16,
    pub flags: i16,
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub height: i16,
    pub source: TextSource,
}

impl TextChunk {
    pub fn parse(tag: Tag, payload: &[u8], base: u64) -> Result<Self, ChunkError> {
        let mut f = FieldReader::new(payload, base);
        let x = f.i16_le()?;
        let y = f.i16_le()?;
        let flags = f.i16_le()?;
        let left = f.i16_le()?;
        let top = f.i16_le()?;
        let right = f.i16_le()?;
        let height = f.i16_le()?;
        f.skip(2)?;

        let source = if tag == Tag::TRES {
            TextSource::Resource(f.u16_le()?)
        } else {
            let raw = f.rest();
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            TextSource::Inline(latin1(&raw[..end]))
        };

        Ok(Self {
            x,
            y,
            flags,
            left,
            top,
            right,
            height,
            source,
        })
    }

    pub fn is_subtitle(&self) -> bool {
        self.flags & FLAG_WRAP != 0
    }
}

// ============================================================================
// Markup
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledText {
    pub font: u8,
    pub color: u8,
    pub text: String,
}

/// Strips leading `/` and every `^f`/`^c` directive; the last one of each wins.
pub fn parse_markup(raw: &str) -> Result<StyledText, TextError> {
    let mut styled = StyledText {
        font: DEFAULT_FONT,
        color: DEFAULT_COLOR,
        text: String::with_capacity(raw.len()),
    };

    let chars: Vec<char> = raw.trim_start_matches('/').chars().collect();
    let digit = |i: usize| chars.get(i).and_then(|c| c.to_digit(10));
    let bad = || TextError::BadEscape(raw.to_string());

    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '^' {
            styled.text.push(chars[i]);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some('f') => {
                digit(i + 2).ok_or_else(bad)?;
                styled.font = digit(i + 3).ok_or_else(bad)? as u8;
                i += 4;
            }
            Some('c') => {
                digit(i + 2).ok_or_else(bad)?;
                let tens = digit(i + 3).ok_or_else(bad)?;
                let ones = digit(i + 4).ok_or_else(bad)?;
                styled.color = (tens * 10 + ones) as u8;
                i += 5;
            }
            _ => return Err(bad()),
        }
    }
    Ok(styled)
}

// ============================================================================
// Fonts
// ============================================================================

/// Glyph source for the overlay.
pub trait FontSet {
    fn line_height(&self, font: u8) -> usize;

    fn char_width(&self, font: u8, ch: char) -> usize;

    /// Draws one glyph with its top-left at `(x, y)`.
    fn draw_char(&self, dst: &mut Surface, font: u8, ch: char, x: i32, y: i32, color: u8);

    fn text_width(&self, font: u8, text: &str) -> usize {
        text.chars().map(|c| self.char_width(font, c)).sum()
    }
}

/// Solid block glyphs; enough to see where text lands.
#[derive(Debug, Clone, Copy)]
pub struct BlockFont {
    pub cell_width: usize,
    pub cell_height: usize,
}

impl Default for BlockFont {
    fn default() -> Self {
        Self {
            cell_width: 5,
            cell_height: 7,
        }
    }
}

impl FontSet for BlockFont {
    fn line_height(&self, _font: u8) -> usize {
        self.cell_height + 1
    }

    fn char_width(&self, _font: u8, _ch: char) -> usize {
        self.cell_width + 1
    }

    fn draw_char(&self, dst: &mut Surface, _font: u8, ch: char, x: i32, y: i32, color: u8) {
        if ch.is_whitespace() {
            return;
        }
        for dy in 0..self.cell_height as i32 {
            for dx in 0..self.cell_width as i32 {
                dst.put(x + dx, y + dy, color);
            }
        }
    }
}

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedLine {
    pub x: i32,
    pub y: i32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLayout {
    pub font: u8,
    pub color: u8,
    pub lines: Vec<PlacedLine>,
}

fn wrap_lines(fonts: &dyn FontSet, font: u8, text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    for paragraph in text.split('\n') {
        let mut line = String::new();
        for word in paragraph.split(' ').filter(|w| !w.is_empty()) {
            if line.is_empty() {
                line.push_str(word);
                continue;
            }
            let candidate = format!("{} {}", line, word);
            if fonts.text_width(font, &candidate) <= width {
                line = candidate;
            } else {
                out.push(std::mem::replace(&mut line, word.to_string()));
            }
        }
        out.push(line);
    }
    out
}

/// Positions `styled` for `chunk` on a surface of the given size.
pub fn layout(
    chunk: &TextChunk,
    styled: &StyledText,
    fonts: &dyn FontSet,
    surface_width: usize,
    surface_height: usize,
) -> TextLayout {
    let font = styled.font;
    let centered = chunk.flags & FLAG_CENTER != 0;
    let wrapped = chunk.flags & FLAG_WRAP != 0;
    let (x, left) = (i32::from(chunk.x), i32::from(chunk.left));
    let sw = surface_width as i32;

    let mut y = i32::from(chunk.y);
    if centered || wrapped {
        y = y.max(i32::from(chunk.top));
    }

    let right = if wrapped && centered {
        (left + i32::from(chunk.right)).min(sw)
    } else {
        i32::from(chunk.right)
    };

    let lines: Vec<String> = if wrapped {
        let width = (right - left).max(1) as usize;
        wrap_lines(fonts, font, &styled.text, width)
    } else {
        styled.text.split('\n').map(str::to_string).collect()
    };

    // Keep the block on screen
    let line_height = fonts.line_height(font) as i32;
    let total = line_height * lines.len() as i32;
    if y + total > surface_height as i32 {
        y = (surface_height as i32 - total).max(0);
    }

    let placed = lines
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            let w = fonts.text_width(font, &text) as i32;
            let lx = match (centered, wrapped) {
                (true, true) => (x - w / 2).min(right - w).max(left),
                (true, false) => (x - w / 2).min(sw - w).max(0),
                (false, true) => x.min(right - w).max(left),
                (false, false) => x,
            };
            PlacedLine {
                x: lx,
                y: y + i as i32 * line_height,
                text,
            }
        })
        .collect();

    TextLayout {
        font,
        color: styled.color,
        lines: placed,
    }
}

// ============================================================================
// Renderer
// ============================================================================

/// Resolves, lays out and draws text chunks.
#[derive(Debug, Clone, Default)]
pub struct TextOverlay {
    pub subtitles: bool,
    strings: Option<StringTable>,
}

impl TextOverlay {
    pub fn new(subtitles: bool) -> Self {
        Self {
            subtitles,
            strings: None,
        }
    }

    pub fn set_strings(&mut self, strings: Option<StringTable>) {
        self.strings = strings;
    }

    pub fn has_strings(&self) -> bool {
        self.strings.is_some()
    }

    /// Draws `chunk`; `Ok(None)` when nothing was drawn.
    pub fn render(
        &self,
        chunk: &TextChunk,
        dst: &mut Surface,
        fonts: &dyn FontSet,
    ) -> Result<Option<TextLayout>, TextError> {
        let raw = match &chunk.source {
            TextSource::Inline(s) => s.as_str(),
            TextSource::Resource(id) => {
                let Some(strings) = &self.strings else {
                    return Ok(None);
                };
                match strings.get(u32::from(*id)) {
                    Some(s) => s,
                    None => {
                        tracing::debug!("String {} missing from table", id);
                        return Ok(None);
                    }
                }
            }
        };

        if !self.subtitles && chunk.is_subtitle() {
            return Ok(None);
        }

        let styled = parse_markup(raw)?;
        let placed = layout(chunk, &styled, fonts, dst.width, dst.height);
        for line in &placed.lines {
            let mut cx = line.x;
            for ch in line.text.chars() {
                fonts.draw_char(dst, placed.font, ch, cx, line.y, placed.color);
                cx += fonts.char_width(placed.font, ch) as i32;
            }
        }
        Ok(Some(placed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TextBox;

    const TABLE: &str = "#intro line 1\r\nHello there\r\n//and welcome\r\n\r\n\
#22 ignored words 22\nFirst\nSecond\n#3\n^c004Red\n";

    #[test]
    fn test_string_table_parse() {
        let table = StringTable::parse(TABLE);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1), Some("Hello there and welcome"));
        assert_eq!(table.get(22), Some("First\nSecond"));
        assert_eq!(table.get(3), Some("^c004Red"));
        assert_eq!(table.get(4), None);
    }

    #[test]
    fn test_string_table_header_trailing_text() {
        let table = StringTable::parse("#22 x22;\nTwenty-two\n\n#é\nNo id\n");
        assert_eq!(table.get(22), Some("Twenty-two"));
        assert_eq!(table.len(), 1);
        assert_eq!(trailing_number("#LINE 0073 ; done"), Some(73));
        assert_eq!(trailing_number("#é7é"), Some(7));
    }

    #[test]
    fn test_etrs_decoding() {
        let mut data = b"ETRS".to_vec();
        data.extend_from_slice(&[0u8; 12]);
        data.extend(TABLE.bytes().map(|b| b ^ 0xCC));
        let table = StringTable::from_bytes(&data);
        assert_eq!(table.get(22), Some("First\nSecond"));
    }

    #[test]
    fn test_markup() {
        let styled = parse_markup("//^f01^c123Hello").unwrap();
        assert_eq!(styled.font, 1);
        assert_eq!(styled.color, 23);
        assert_eq!(styled.text, "Hello");

        let inline = parse_markup("A^c007B^c009C").unwrap();
        assert_eq!(inline.text, "ABC");
        assert_eq!(inline.color, 9);

        let plain = parse_markup("Plain").unwrap();
        assert_eq!((plain.font, plain.color), (DEFAULT_FONT, DEFAULT_COLOR));

        assert!(matches!(parse_markup("^x12oops"), Err(TextError::BadEscape(_))));
        assert!(matches!(parse_markup("cut^c1"), Err(TextError::BadEscape(_))));
    }

    #[test]
    fn test_chunk_parse() {
        let boxed = TextBox::at(160, 20);
        let text = TextChunk::parse(Tag::TEXT, &boxed.inline_payload("Hi"), 0).unwrap();
        assert_eq!(text.source, TextSource::Inline("Hi".to_string()));
        assert_eq!((text.x, text.y), (160, 20));

        let res = TextChunk::parse(Tag::TRES, &boxed.resource_payload(22), 0).unwrap();
        assert_eq!(res.source, TextSource::Resource(22));

        assert!(TextChunk::parse(Tag::TRES, &[0u8; 10], 0).is_err());
    }

    #[test]
    fn test_centered_layout() {
        let mut boxed = TextBox::at(160, 10);
        boxed.flags = FLAG_CENTER;
        boxed.top = 40;
        let chunk = TextChunk::parse(Tag::TEXT, &boxed.inline_payload("abcd"), 0).unwrap();
        let styled = parse_markup("abcd").unwrap();

        let placed = layout(&chunk, &styled, &BlockFont::default(), 320, 200);
        assert_eq!(placed.lines.len(), 1);
        // 4 glyphs of 6px centred on 160; y clamped to top
        assert_eq!(placed.lines[0].x, 148);
        assert_eq!(placed.lines[0].y, 40);
    }

    #[test]
    fn test_wrapped_layout_stays_in_box() {
        let mut boxed = TextBox::at(100, 150);
        boxed.flags = FLAG_CENTER | FLAG_WRAP;
        boxed.left = 40;
        boxed.right = 120;
        let chunk = TextChunk::parse(Tag::TEXT, &boxed.inline_payload(""), 0).unwrap();
        let styled = parse_markup("one two three four five six seven").unwrap();

        let fonts = BlockFont::default();
        let placed = layout(&chunk, &styled, &fonts, 320, 200);
        assert!(placed.lines.len() > 1);
        for line in &placed.lines {
            let w = fonts.text_width(0, &line.text) as i32;
            assert!(line.x >= 40);
            assert!(line.x + w <= 160, "line {:?} overflows", line);
        }
        let last = placed.lines.last().unwrap();
        assert!(last.y + fonts.line_height(0) as i32 <= 200);
    }

    #[test]
    fn test_subtitles_suppressed() {
        let mut boxed = TextBox::at(10, 10);
        boxed.flags = FLAG_WRAP;
        boxed.right = 300;
        let chunk = TextChunk::parse(Tag::TEXT, &boxed.inline_payload("Subtitle"), 0).unwrap();
        let mut surface = Surface::new(320, 200);

        let overlay = TextOverlay::new(false);
        assert!(overlay.render(&chunk, &mut surface, &BlockFont::default()).unwrap().is_none());
        assert!(surface.pixels.iter().all(|&p| p == 0));

        let overlay = TextOverlay::new(true);
        assert!(overlay.render(&chunk, &mut surface, &BlockFont::default()).unwrap().is_some());
        assert_eq!(surface.get(10, 10), Some(DEFAULT_COLOR));
    }

    #[test]
    fn test_resource_without_table_skipped() {
        let chunk = TextChunk::parse(Tag::TRES, &TextBox::at(0, 0).resource_payload(1), 0).unwrap();
        let mut surface = Surface::new(64, 64);
        let mut overlay = TextOverlay::new(true);
        assert!(overlay.render(&chunk, &mut surface, &BlockFont::default()).unwrap().is_none());

        overlay.set_strings(Some(StringTable::parse(TABLE)));
        let placed = overlay.render(&chunk, &mut surface, &BlockFont::default()).unwrap().unwrap();
        assert_eq!(placed.lines[0].text, "Hello there and welcome");
    }

    #[test]
    fn test_bad_escape_is_fatal() {
        let chunk = TextChunk::parse(Tag::TEXT, &TextBox::at(0, 0).inline_payload("^zz"), 0).unwrap();
        let mut surface = Surface::new(64, 64);
        assert!(TextOverlay::new(true)
            .render(&chunk, &mut surface, &BlockFont::default())
            .is_err());
    }
}
