//! Canonical caption files: WebVTT writing, tolerant parsing, keyword search.
//!
//! Cue times are written as `HH:MM:SS.mmm` with millisecond rounding, and the
//! parser reads them back to the same millisecond, so a caption file written
//! from cached segments is byte-identical to one written from fresh segments.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{CaptionFile, CaptionHit, CaptionRecord};

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Format seconds as `HH:MM:SS.mmm`.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1_000;
    let ms = total_ms % 1_000;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Parse `HH:MM:SS.mmm` or `MM:SS.mmm` (a `,` separator is also accepted).
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    let parts: Vec<&str> = s.split(':').collect();
    let (h, m, rest) = match parts.as_slice() {
        [h, m, rest] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, *rest),
        [m, rest] => (0, m.parse::<u64>().ok()?, *rest),
        _ => return None,
    };
    if m >= 60 {
        return None;
    }

    let (secs, frac) = rest.split_once(['.', ',']).unwrap_or((rest, "0"));
    let secs: u64 = secs.parse().ok()?;
    if secs >= 60 || frac.is_empty() || frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    // "5" after the separator means 500 ms, not 5 ms.
    let ms: u64 = format!("{frac:0<3}").parse().ok()?;

    let total_ms = ((h * 60 + m) * 60 + secs) * 1000 + ms;
    Some(total_ms as f64 / 1000.0)
}

/// Render a caption file as WebVTT.
pub fn to_vtt(file: &CaptionFile) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for record in file.records() {
        out.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(record.start),
            format_timestamp(record.end)
        ));
        let text: Vec<String> = record
            .text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(escape_text)
            .collect();
        out.push_str(&text.join("\n"));
        out.push_str("\n\n");
    }
    out
}

/// Cue payloads may not carry a raw `&`, `<` or `>`.
fn escape_text(line: &str) -> String {
    line.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Write a caption file to `path` as WebVTT.
pub async fn write_vtt(file: &CaptionFile, path: &Path) -> Result<()> {
    tokio::fs::write(path, to_vtt(file)).await?;
    debug!(path = %path.display(), cues = file.records().len(), "caption file written");
    Ok(())
}

/// Parse WebVTT content. Malformed cues are skipped; content with neither a
/// `WEBVTT` header nor a single valid cue is rejected.
pub fn parse_vtt(content: &str, id: &str) -> std::result::Result<CaptionFile, String> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut blocks = content.split("\n\n").map(str::trim).filter(|b| !b.is_empty());

    let mut records = Vec::new();
    let mut skipped = 0usize;
    let mut has_header = false;

    if let Some(first) = blocks.next() {
        if first.starts_with("WEBVTT") {
            has_header = true;
            // Sloppy files put the first cue directly under the header.
            if let Some(record) = first.contains("-->").then(|| parse_cue(first)).flatten() {
                records.push(record);
            }
        } else {
            match parse_cue(first) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }
    }

    for block in blocks {
        if block.starts_with("NOTE") || block.starts_with("STYLE") || block.starts_with("REGION") {
            continue;
        }
        match parse_cue(block) {
            Some(record) => records.push(record),
            None => {
                skipped += 1;
                warn!(caption = id, block = %block.lines().next().unwrap_or(""), "skipping malformed cue");
            }
        }
    }

    if !has_header && records.is_empty() {
        return Err("no WEBVTT header and no valid cues".into());
    }

    debug!(caption = id, cues = records.len(), skipped, "caption file parsed");
    Ok(CaptionFile::new(id, records))
}

fn parse_cue(block: &str) -> Option<CaptionRecord> {
    let mut lines = block.lines();
    let timing = lines.by_ref().find(|l| l.contains("-->"))?;

    let (start, rest) = timing.split_once("-->")?;
    let end = rest.split_whitespace().next()?;
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    if end < start {
        return None;
    }

    let text: Vec<String> = lines
        .map(|l| decode_entities(&TAG.replace_all(l, "")).trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if text.is_empty() {
        return None;
    }

    Some(CaptionRecord {
        start,
        end,
        text: text.join("\n"),
    })
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Read and parse a caption file from disk. The caption id is the file stem.
pub async fn read_caption_file(path: &Path) -> Result<CaptionFile> {
    let unreadable = |reason: String| Error::CaptionUnreadable {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = tokio::fs::read(path).await.map_err(|e| unreadable(e.to_string()))?;
    let content = String::from_utf8(bytes).map_err(|e| unreadable(e.to_string()))?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    parse_vtt(&content, &id).map_err(unreadable)
}

/// Case-insensitive substring search over caption text.
///
/// The keyword is matched as given, surrounding spaces included. Matches are
/// returned in chronological order, one per matching cue. A keyword that is
/// empty or only whitespace matches nothing.
pub fn search(file: &CaptionFile, keyword: &str) -> Vec<CaptionHit> {
    if keyword.trim().is_empty() {
        return Vec::new();
    }
    let keyword = keyword.to_lowercase();

    file.records()
        .iter()
        .filter(|r| r.text.to_lowercase().contains(&keyword))
        .map(|r| CaptionHit {
            timestamp: r.start,
            text: r.text.clone(),
        })
        .collect()
}

/// Search a caption file on disk. A missing file yields no matches; a file
/// that exists but cannot be parsed is an error.
pub async fn search_file(path: &Path, keyword: &str) -> Result<Vec<CaptionHit>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let file = read_caption_file(path).await?;
    Ok(search(&file, keyword))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    fn record(start: f64, text: &str) -> CaptionRecord {
        CaptionRecord {
            start,
            end: start + 2.0,
            text: text.into(),
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(10.5), "00:00:10.500");
        assert_eq!(format_timestamp(3723.004), "01:02:03.004");
        assert_eq!(format_timestamp(-3.0), "00:00:00.000");
    }

    #[test]
    fn test_format_timestamp_rounds_instead_of_truncating() {
        // 0.29 * 1000 is 289.99999999999997 in f64.
        assert_eq!(format_timestamp(0.29), "00:00:00.290");
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("01:02:03.004"), Some(3723.004));
        assert_eq!(parse_timestamp("02:03.500"), Some(123.5));
        assert_eq!(parse_timestamp("00:00:01,250"), Some(1.25));
        assert_eq!(parse_timestamp("00:00:01.5"), Some(1.5));
        assert_eq!(parse_timestamp("00:00:07"), Some(7.0));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("00:61:00.000"), None);
        assert_eq!(parse_timestamp("00:00:00.1234"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
    }

    #[test]
    fn test_timestamp_roundtrip_exact() {
        for ms in [0u64, 1, 999, 1_000, 59_999, 3_599_999, 36_000_123] {
            let secs = ms as f64 / 1000.0;
            let text = format_timestamp(secs);
            let back = parse_timestamp(&text).unwrap();
            assert_eq!(format_timestamp(back), text);
        }
    }

    #[test]
    fn test_vtt_roundtrip_preserves_records() {
        let file = CaptionFile::new(
            "clip",
            vec![record(1.25, "hello there"), record(3.5, "general kenobi")],
        );
        let parsed = parse_vtt(&to_vtt(&file), "clip").unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn test_vtt_escapes_markup_characters() {
        let file = CaptionFile::new(
            "clip",
            vec![record(1.0, "if a <b and c> d then Q&amp;A"), record(4.0, "&lt;tag&gt;")],
        );
        let vtt = to_vtt(&file);
        assert!(vtt.contains("if a &lt;b and c&gt; d then Q&amp;amp;A"));
        assert_eq!(parse_vtt(&vtt, "clip").unwrap(), file);
    }

    #[test]
    fn test_cached_and_fresh_segments_render_identically() {
        let segments = vec![
            Segment {
                start: 0.29,
                end: 1.71,
                text: " we come in peace".into(),
            },
            Segment {
                start: 1.71,
                end: 4.0,
                text: " come again".into(),
            },
        ];
        let fresh = to_vtt(&CaptionFile::from_segments("v", &segments));
        let cached: Vec<Segment> =
            serde_json::from_str(&serde_json::to_string(&segments).unwrap()).unwrap();
        let rebuilt = to_vtt(&CaptionFile::from_segments("v", &cached));
        assert_eq!(fresh, rebuilt);
        assert!(fresh.contains("00:00:00.290 --> 00:00:01.710"));
    }

    #[test]
    fn test_parse_skips_malformed_cues() {
        let content = "WEBVTT\n\n\
            00:00:01.000 --> 00:00:02.000\nfirst\n\n\
            garbage --> more garbage\nbroken\n\n\
            00:00:05.000 --> 00:00:04.000\nbackwards\n\n\
            NOTE this is a comment\n\n\
            3\n00:00:06.000 --> 00:00:07.000 align:start position:0%\n<c>third</c> &amp; last\n";
        let file = parse_vtt(content, "x").unwrap();
        let texts: Vec<&str> = file.records().iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "third & last"]);
    }

    #[test]
    fn test_parse_handles_crlf_and_bom() {
        let content = "\u{feff}WEBVTT\r\n\r\n00:01.000 --> 00:02.000\r\nhi\r\n";
        let file = parse_vtt(content, "x").unwrap();
        assert_eq!(file.records().len(), 1);
        assert_eq!(file.records()[0].start, 1.0);
    }

    #[test]
    fn test_parse_empty_vtt_is_valid() {
        let file = parse_vtt("WEBVTT\n", "x").unwrap();
        assert!(file.is_empty());
    }

    #[test]
    fn test_parse_rejects_unreadable_content() {
        assert!(parse_vtt("this is not a caption file at all", "x").is_err());
        assert!(parse_vtt("", "x").is_err());
    }

    #[test]
    fn test_search_case_insensitive_chronological() {
        let file = CaptionFile::new(
            "x",
            vec![
                record(30.0, "Cats!"),
                record(10.0, "a cat sat"),
                record(20.0, "a dog ran"),
            ],
        );
        let hits = search(&file, "cat");
        assert_eq!(
            hits,
            vec![
                CaptionHit {
                    timestamp: 10.0,
                    text: "a cat sat".into()
                },
                CaptionHit {
                    timestamp: 30.0,
                    text: "Cats!".into()
                },
            ]
        );
    }

    #[test]
    fn test_search_reports_cue_once() {
        let file = CaptionFile::new("x", vec![record(1.0, "cat cat CAT")]);
        assert_eq!(search(&file, "cat").len(), 1);
    }

    #[test]
    fn test_search_keeps_keyword_spaces() {
        let file = CaptionFile::new(
            "x",
            vec![record(1.0, "concat the files"), record(5.0, "the cat sat")],
        );
        let hits = search(&file, " cat");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].timestamp, 5.0);
        assert_eq!(search(&file, "cat").len(), 2);
    }

    #[test]
    fn test_search_empty_keyword() {
        let file = CaptionFile::new("x", vec![record(1.0, "anything")]);
        assert!(search(&file, "").is_empty());
        assert!(search(&file, "   ").is_empty());
    }

    #[tokio::test]
    async fn test_search_file_missing_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let hits = search_file(&tmp.path().join("nope.vtt"), "cat").await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_file_unreadable_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.vtt");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x01]).unwrap();
        let err = search_file(&path, "cat").await.unwrap_err();
        assert!(matches!(err, Error::CaptionUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("abc123.vtt");
        let file = CaptionFile::new(
            "abc123",
            vec![CaptionRecord {
                start: 12.345,
                end: 14.5,
                text: "come here".into(),
            }],
        );
        write_vtt(&file, &path).await.unwrap();

        let read = read_caption_file(&path).await.unwrap();
        assert_eq!(read, file);
        assert_eq!(search_file(&path, "COME").await.unwrap().len(), 1);
    }
}
