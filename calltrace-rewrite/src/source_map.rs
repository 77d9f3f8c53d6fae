// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Source-map consumption.
//!
//! When a compiled module declares an inline or adjacent source map, the
//! interceptor derives the metadata filename from it and maps compiled
//! positions back to original positions, so emitted events report the file
//! the author actually wrote. Only the standard version-3 format with
//! base64-VLQ `mappings` is understood.

use base64::Engine;
use serde::Deserialize;

use crate::RewriteError;

/// An original position resolved through a source map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Deserialize)]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    file: Option<String>,
    sources: Vec<String>,
    mappings: String,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    generated_column: u32,
    source: u32,
    source_line: u32,
    source_column: u32,
}

/// A parsed version-3 source map.
#[derive(Debug)]
pub struct SourceMap {
    file: Option<String>,
    sources: Vec<String>,
    // One vector of segments per generated line, sorted by generated column.
    lines: Vec<Vec<Segment>>,
}

impl SourceMap {
    /// Parse a source map from its JSON text.
    pub fn parse(json: &str) -> Result<SourceMap, RewriteError> {
        let raw: RawSourceMap = serde_json::from_str(json)
            .map_err(|err| RewriteError::SourceMap(err.to_string()))?;
        if raw.version != 3 {
            return Err(RewriteError::SourceMap(format!(
                "unsupported source map version {}",
                raw.version
            )));
        }

        let mut lines = Vec::new();
        let mut source = 0i64;
        let mut source_line = 0i64;
        let mut source_column = 0i64;
        for group in raw.mappings.split(';') {
            let mut segments = Vec::new();
            let mut generated_column = 0i64;
            for segment in group.split(',').filter(|s| !s.is_empty()) {
                let fields = decode_vlq(segment)?;
                if fields.is_empty() {
                    continue;
                }
                generated_column += fields[0];
                if fields.len() >= 4 {
                    source += fields[1];
                    source_line += fields[2];
                    source_column += fields[3];
                    segments.push(Segment {
                        generated_column: generated_column.max(0) as u32,
                        source: source.max(0) as u32,
                        source_line: source_line.max(0) as u32,
                        source_column: source_column.max(0) as u32,
                    });
                }
            }
            lines.push(segments);
        }

        Ok(SourceMap {
            file: raw.file,
            sources: raw.sources,
            lines,
        })
    }

    /// Extract the inline source map declared by the final
    /// `sourceMappingURL` comment, when it carries a base64 data URL.
    pub fn extract_inline(source: &str) -> Option<Result<SourceMap, RewriteError>> {
        const MARKER: &str = "sourceMappingURL=data:application/json;base64,";
        let start = source.rfind(MARKER)? + MARKER.len();
        let payload: String = source[start..]
            .chars()
            .take_while(|c| !c.is_whitespace())
            .collect();
        let decoded = match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => return Some(Err(RewriteError::SourceMap(err.to_string()))),
        };
        match String::from_utf8(decoded) {
            Ok(json) => Some(SourceMap::parse(&json)),
            Err(err) => Some(Err(RewriteError::SourceMap(err.to_string()))),
        }
    }

    /// The authored filename this map points at, if it names one.
    pub fn primary_source(&self) -> Option<&str> {
        self.sources.first().map(|s| s.as_str())
    }

    pub fn generated_file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// Map a compiled (1-based line, 0-based column) to an original
    /// position: the nearest segment at or before the column on that line.
    pub fn original(&self, line: u32, column: u32) -> Option<OriginalPosition> {
        let segments = self.lines.get(line.checked_sub(1)? as usize)?;
        let segment = segments
            .iter()
            .take_while(|s| s.generated_column <= column)
            .last()
            .or_else(|| segments.first())?;
        Some(OriginalPosition {
            file: self.sources.get(segment.source as usize)?.clone(),
            line: segment.source_line + 1,
            column: segment.source_column,
        })
    }
}

const VLQ_BASE_SHIFT: u32 = 5;
const VLQ_BASE_MASK: i64 = 0b11111;
const VLQ_CONTINUATION: i64 = 0b100000;

fn decode_vlq(segment: &str) -> Result<Vec<i64>, RewriteError> {
    let mut out = Vec::new();
    let mut value = 0i64;
    let mut shift = 0u32;
    for ch in segment.chars() {
        let digit = base64_digit(ch)
            .ok_or_else(|| RewriteError::SourceMap(format!("invalid VLQ digit {:?}", ch)))?;
        value += (digit & VLQ_BASE_MASK) << shift;
        if digit & VLQ_CONTINUATION != 0 {
            shift += VLQ_BASE_SHIFT;
        } else {
            let negative = value & 1 == 1;
            let magnitude = value >> 1;
            out.push(if negative { -magnitude } else { magnitude });
            value = 0;
            shift = 0;
        }
    }
    Ok(out)
}

fn base64_digit(ch: char) -> Option<i64> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    ALPHABET.iter().position(|c| *c as char == ch).map(|p| p as i64)
}
