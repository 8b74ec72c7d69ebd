// SDF bitmap font descriptor parsing
//
// The GUI text pipeline samples a signed distance field atlas described
// by an AngelCode .fnt file. The file is plain ASCII; after four header
// lines every glyph line looks like:
//
//   char id=65 x=132 y=68 width=28 height=30 xoffset=-1 yoffset=4 xadvance=25 ...
//
// We only care about the first eight numbers, so parsing is a forward
// scan that seeks to each '=' and reads the integer after it.
use crate::{DerechoError, Result};

/// Metrics for one glyph in the atlas, in texel units.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SdfGlyph {
    pub g_id: u8,
    pub g_x: u16,
    pub g_y: u16,
    pub g_width: u8,
    pub g_height: u8,
    pub g_xoffset: i8,
    pub g_yoffset: i8,
    pub g_xadvance: u8,
}

/// A parsed font descriptor: glyphs in file order plus a byte lookup.
#[derive(Debug)]
pub struct SdfFont {
    sf_glyphs: Vec<SdfGlyph>,
}

impl SdfFont {
    pub fn glyphs(&self) -> &[SdfGlyph] {
        &self.sf_glyphs
    }

    /// Find the glyph for an ASCII byte, or None for uncovered input.
    pub fn lookup(&self, id: u8) -> Option<&SdfGlyph> {
        self.sf_glyphs.iter().find(|g| g.g_id == id)
    }
}

/// Forward-only scanning cursor over the file contents.
struct Cursor<'a> {
    c_data: &'a [u8],
    c_pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { c_data: data, c_pos: 0 }
    }

    /// Seek just past the next occurrence of `byte`.
    fn forward(&mut self, byte: u8) -> Result<&mut Self> {
        while self.c_pos < self.c_data.len() {
            let cur = self.c_data[self.c_pos];
            self.c_pos += 1;
            if cur == byte {
                return Ok(self);
            }
        }
        Err(DerechoError::ASSET_PARSE_FAILURE)
    }

    /// Read a (possibly negative) integer at the cursor.
    fn read_int(&mut self) -> Result<i32> {
        let mut negative = false;
        if self.c_pos < self.c_data.len() && self.c_data[self.c_pos] == b'-' {
            negative = true;
            self.c_pos += 1;
        }

        let start = self.c_pos;
        while self.c_pos < self.c_data.len() && self.c_data[self.c_pos].is_ascii_digit() {
            self.c_pos += 1;
        }
        if self.c_pos == start {
            return Err(DerechoError::ASSET_PARSE_FAILURE);
        }

        let mut value: i32 = 0;
        for d in &self.c_data[start..self.c_pos] {
            value = value * 10 + i32::from(d - b'0');
        }
        Ok(if negative { -value } else { value })
    }

    fn at_end(&self) -> bool {
        self.c_pos >= self.c_data.len()
    }
}

/// Parse a .fnt descriptor.
///
/// The four info/common/page/chars header lines are skipped, then glyph
/// lines are consumed until the file runs out (the trailing kerning
/// section, if present, stops the scan at the first line without the
/// eight expected fields).
pub fn parse(contents: &str) -> Result<SdfFont> {
    let bytes = contents.as_bytes();
    let mut cursor = Cursor::new(bytes);

    for _ in 0..4 {
        cursor.forward(b'\n')?;
    }

    let mut glyphs = Vec::new();
    while !cursor.at_end() {
        let glyph = match parse_glyph(&mut cursor) {
            Ok(g) => g,
            // ran into the kerning block or trailing junk
            Err(_) => break,
        };
        glyphs.push(glyph);

        if cursor.forward(b'\n').is_err() {
            break;
        }
    }

    if glyphs.is_empty() {
        return Err(DerechoError::ASSET_PARSE_FAILURE);
    }

    Ok(SdfFont { sf_glyphs: glyphs })
}

fn parse_glyph(cursor: &mut Cursor) -> Result<SdfGlyph> {
    Ok(SdfGlyph {
        g_id: cursor.forward(b'=')?.read_int()? as u8,
        g_x: cursor.forward(b'=')?.read_int()? as u16,
        g_y: cursor.forward(b'=')?.read_int()? as u16,
        g_width: cursor.forward(b'=')?.read_int()? as u8,
        g_height: cursor.forward(b'=')?.read_int()? as u8,
        g_xoffset: cursor.forward(b'=')?.read_int()? as i8,
        g_yoffset: cursor.forward(b'=')?.read_int()? as i8,
        g_xadvance: cursor.forward(b'=')?.read_int()? as u8,
    })
}

/// Load and parse a descriptor from disk. A missing font file is an
/// asset failure the caller may decide to live without.
pub fn load(path: &str) -> Result<SdfFont> {
    let contents = std::fs::read_to_string(path).or(Err(DerechoError::ASSET_NOT_FOUND))?;
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "info face=\"Lucida Sans\" size=64 bold=0\n\
                          common lineHeight=70 base=53 scaleW=512 scaleH=512\n\
                          page id=0 file=\"lucida_sans_sdf.png\"\n\
                          chars count=3\n\
                          char id=65 x=132 y=68 width=28 height=30 xoffset=-1 yoffset=4 xadvance=25 page=0 chnl=15\n\
                          char id=66 x=201 y=12 width=22 height=30 xoffset=2 yoffset=4 xadvance=24 page=0 chnl=15\n\
                          char id=32 x=0 y=0 width=0 height=0 xoffset=0 yoffset=0 xadvance=14 page=0 chnl=15\n";

    #[test]
    fn parses_glyph_lines() {
        let font = parse(SAMPLE).unwrap();
        assert_eq!(font.glyphs().len(), 3);

        let a = font.lookup(b'A').unwrap();
        assert_eq!(
            *a,
            SdfGlyph {
                g_id: 65,
                g_x: 132,
                g_y: 68,
                g_width: 28,
                g_height: 30,
                g_xoffset: -1,
                g_yoffset: 4,
                g_xadvance: 25,
            }
        );

        let space = font.lookup(b' ').unwrap();
        assert_eq!(space.g_xadvance, 14);
    }

    #[test]
    fn negative_offsets_survive() {
        let font = parse(SAMPLE).unwrap();
        assert_eq!(font.lookup(65).unwrap().g_xoffset, -1);
    }

    #[test]
    fn missing_glyphs_return_none() {
        let font = parse(SAMPLE).unwrap();
        assert!(font.lookup(b'z').is_none());
    }

    #[test]
    fn truncated_header_is_a_parse_failure() {
        assert_eq!(
            parse("info face=\"x\"\n").unwrap_err(),
            DerechoError::ASSET_PARSE_FAILURE
        );
    }
}
