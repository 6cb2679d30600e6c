//! Source-map v3 decoding and generated→authored lookup.
//!
//! Supports flat maps and offset-indexed `sections`, inline
//! `sourcesContent`, and `sourceRoot`. Lookup returns the nearest entry on
//! the generated line whose generated column does not exceed the query.

use serde::Deserialize;

use crate::error::AdapterError;

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Clone, Debug, PartialEq)]
pub struct MappingEntry {
    pub generated_column: u32,
    pub source_index: Option<u32>,
    pub source_line: u32,
    pub source_column: u32,
}

#[derive(Clone, Debug)]
pub struct SourceMap {
    sources: Vec<String>,
    sources_content: Vec<Option<String>>,
    /// Entries per generated line, sorted by generated column.
    lines: Vec<Vec<MappingEntry>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMap {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    sources_content: Vec<Option<String>>,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    mappings: String,
    #[serde(default)]
    sections: Vec<RawSection>,
}

#[derive(Deserialize)]
struct RawSection {
    offset: SectionOffset,
    map: RawMap,
}

#[derive(Deserialize)]
struct SectionOffset {
    line: u32,
    column: u32,
}

impl SourceMap {
    pub fn parse(text: &str) -> Result<Self, AdapterError> {
        let raw: RawMap =
            serde_json::from_str(text).map_err(|err| AdapterError::SourceMap(err.to_string()))?;
        if let Some(version) = raw.version {
            if version != 3 {
                return Err(AdapterError::SourceMap(format!(
                    "unsupported source map version {version}"
                )));
            }
        }

        let mut map = SourceMap {
            sources: Vec::new(),
            sources_content: Vec::new(),
            lines: Vec::new(),
        };
        if raw.sections.is_empty() {
            map.absorb(raw, 0, 0)?;
        } else {
            for section in raw.sections {
                map.absorb(section.map, section.offset.line, section.offset.column)?;
            }
        }
        for line in &mut map.lines {
            line.sort_by_key(|entry| entry.generated_column);
        }
        Ok(map)
    }

    fn absorb(&mut self, raw: RawMap, line_offset: u32, column_offset: u32) -> Result<(), AdapterError> {
        let source_offset = self.sources.len() as u32;
        let root = raw.source_root.unwrap_or_default();
        for source in &raw.sources {
            self.sources.push(apply_source_root(&root, source));
        }
        let mut contents = raw.sources_content;
        contents.resize(raw.sources.len(), None);
        self.sources_content.extend(contents);

        let mut source_index: i64 = 0;
        let mut source_line: i64 = 0;
        let mut source_column: i64 = 0;
        for (line_number, line_text) in raw.mappings.split(';').enumerate() {
            let generated_line = line_offset as usize + line_number;
            let mut generated_column: i64 = if line_number == 0 {
                column_offset as i64
            } else {
                0
            };
            if line_text.is_empty() {
                continue;
            }
            for segment in line_text.split(',') {
                if segment.is_empty() {
                    continue;
                }
                let fields = decode_vlq_segment(segment)?;
                generated_column += fields[0];
                if generated_column < 0 {
                    return Err(AdapterError::SourceMap("negative generated column".into()));
                }
                let entry = if fields.len() >= 4 {
                    source_index += fields[1];
                    source_line += fields[2];
                    source_column += fields[3];
                    if source_index < 0 || source_line < 0 || source_column < 0 {
                        return Err(AdapterError::SourceMap("negative mapping field".into()));
                    }
                    MappingEntry {
                        generated_column: generated_column as u32,
                        source_index: Some(source_offset + source_index as u32),
                        source_line: source_line as u32,
                        source_column: source_column as u32,
                    }
                } else {
                    MappingEntry {
                        generated_column: generated_column as u32,
                        source_index: None,
                        source_line: 0,
                        source_column: 0,
                    }
                };
                if self.lines.len() <= generated_line {
                    self.lines.resize(generated_line + 1, Vec::new());
                }
                self.lines[generated_line].push(entry);
            }
        }
        Ok(())
    }

    /// Nearest entry with `generated_line == line` and
    /// `generated_column <= column`.
    pub fn lookup(&self, line: u32, column: u32) -> Option<&MappingEntry> {
        let entries = self.lines.get(line as usize)?;
        let idx = entries.partition_point(|entry| entry.generated_column <= column);
        if idx == 0 {
            return None;
        }
        let entry = &entries[idx - 1];
        entry.source_index?;
        Some(entry)
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn source_url(&self, index: u32) -> Option<&str> {
        self.sources.get(index as usize).map(String::as_str)
    }

    pub fn embedded_content(&self, index: u32) -> Option<&str> {
        self.sources_content
            .get(index as usize)
            .and_then(|content| content.as_deref())
    }
}

fn apply_source_root(root: &str, source: &str) -> String {
    if root.is_empty() || source.contains("://") || source.starts_with('/') {
        return source.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), source)
}

fn decode_vlq_segment(segment: &str) -> Result<Vec<i64>, AdapterError> {
    let mut fields = Vec::with_capacity(5);
    let mut value: i64 = 0;
    let mut shift: u32 = 0;
    for &byte in segment.as_bytes() {
        let digit = BASE64_ALPHABET
            .iter()
            .position(|&c| c == byte)
            .ok_or_else(|| AdapterError::SourceMap(format!("invalid VLQ byte {byte:#x}")))?
            as i64;
        value += (digit & 31) << shift;
        if digit & 32 == 0 {
            let negative = value & 1 == 1;
            let mut decoded = value >> 1;
            if negative {
                decoded = -decoded;
            }
            fields.push(decoded);
            value = 0;
            shift = 0;
        } else {
            shift += 5;
        }
    }
    if shift != 0 {
        return Err(AdapterError::SourceMap("truncated VLQ segment".into()));
    }
    Ok(fields)
}

/// Base for resolving an authored source URL: the compiled script's URL when
/// the map was inlined as a `data:` URL, otherwise the map's own URL.
pub fn resolve_authored_url(map_url: &str, compiled_url: &str, source: &str) -> String {
    if source.contains("://") {
        return source.to_string();
    }
    let base = if map_url.starts_with("data:") {
        compiled_url
    } else {
        map_url
    };
    if let Ok(base_url) = url::Url::parse(base) {
        if let Ok(resolved) = base_url.join(source) {
            return resolved.to_string();
        }
    }
    // Base is a bare filesystem path; resolve by path convention.
    if source.starts_with('/') {
        return format!("file://{source}");
    }
    let dir = match base.rfind('/') {
        Some(idx) => &base[..idx],
        None => "",
    };
    if dir.is_empty() {
        source.to_string()
    } else {
        format!("{dir}/{source}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two generated lines over one authored file:
    //   line 0: col 0 -> a.ts 0:0, col 4 -> a.ts 1:2
    //   line 1: col 0 -> a.ts 2:2
    const SIMPLE: &str =
        r#"{"version":3,"sources":["a.ts"],"mappings":"AAAA,IACE;AACA"}"#;

    #[test]
    fn decodes_vlq_mappings() {
        let map = SourceMap::parse(SIMPLE).unwrap();
        let entry = map.lookup(0, 0).unwrap();
        assert_eq!((entry.source_line, entry.source_column), (0, 0));
        let entry = map.lookup(0, 9).unwrap();
        assert_eq!((entry.source_line, entry.source_column), (1, 2));
        let entry = map.lookup(1, 3).unwrap();
        assert_eq!((entry.source_line, entry.source_column), (2, 2));
    }

    #[test]
    fn lookup_picks_nearest_entry_at_or_before_column() {
        let map = SourceMap::parse(SIMPLE).unwrap();
        assert_eq!(map.lookup(0, 3).unwrap().source_column, 0);
        assert_eq!(map.lookup(0, 4).unwrap().source_column, 2);
        assert!(map.lookup(2, 0).is_none());
    }

    #[test]
    fn source_root_prefixes_relative_sources() {
        let map = SourceMap::parse(
            r#"{"version":3,"sourceRoot":"webpack:///src/","sources":["a.ts","/abs.ts"],"mappings":"AAAA"}"#,
        )
        .unwrap();
        assert_eq!(map.source_url(0), Some("webpack:///src/a.ts"));
        assert_eq!(map.source_url(1), Some("/abs.ts"));
    }

    #[test]
    fn sections_shift_generated_lines_and_sources() {
        let map = SourceMap::parse(
            r#"{
                "version": 3,
                "sections": [
                    {"offset": {"line": 0, "column": 0},
                     "map": {"version": 3, "sources": ["a.ts"], "mappings": "AAAA"}},
                    {"offset": {"line": 10, "column": 0},
                     "map": {"version": 3, "sources": ["b.ts"], "mappings": "AAAA"}}
                ]
            }"#,
        )
        .unwrap();
        let first = map.lookup(0, 5).unwrap();
        assert_eq!(map.source_url(first.source_index.unwrap()), Some("a.ts"));
        let second = map.lookup(10, 0).unwrap();
        assert_eq!(map.source_url(second.source_index.unwrap()), Some("b.ts"));
    }

    #[test]
    fn embedded_content_is_exposed_per_source() {
        let map = SourceMap::parse(
            r#"{"version":3,"sources":["a.ts"],"sourcesContent":["const x = 1;\n"],"mappings":"AAAA"}"#,
        )
        .unwrap();
        assert_eq!(map.embedded_content(0), Some("const x = 1;\n"));
    }

    #[test]
    fn rejects_non_v3_maps_and_bad_vlq() {
        assert!(SourceMap::parse(r#"{"version":2,"mappings":""}"#).is_err());
        assert!(SourceMap::parse(r#"{"version":3,"sources":["a"],"mappings":"!!"}"#).is_err());
    }

    #[test]
    fn authored_urls_resolve_against_map_or_compiled_url() {
        assert_eq!(
            resolve_authored_url("http://host/dist/app.js.map", "http://host/dist/app.js", "../src/a.ts"),
            "http://host/src/a.ts"
        );
        assert_eq!(
            resolve_authored_url("data:application/json;base64,xyz", "http://host/dist/app.js", "a.ts"),
            "http://host/dist/a.ts"
        );
        assert_eq!(
            resolve_authored_url("/proj/out/app.js.map", "/proj/out/app.js", "/proj/src/a.ts"),
            "file:///proj/src/a.ts"
        );
        assert_eq!(
            resolve_authored_url("webpack:///main.js.map", "main.js", "webpack:///./src/a.ts"),
            "webpack:///./src/a.ts"
        );
    }
}
