//! WebVTT and SRT subtitle parsing, plus auto-caption de-duplication.

use regex::Regex;

use super::TranscriptSegment;

/// Parse WebVTT subtitle content.
pub fn parse_vtt(text: &str) -> Vec<TranscriptSegment> {
    let header = Regex::new(r"(?s)WEBVTT.*?\n\n").expect("static regex");
    let style = Regex::new(r"(?s)STYLE.*?(\n\n|\z)").expect("static regex");
    let note = Regex::new(r"(?s)NOTE.*?(\n\n|\z)").expect("static regex");

    let cleaned = header.replace(text, "");
    let cleaned = style.replace_all(&cleaned, "");
    let cleaned = note.replace_all(&cleaned, "");

    let ts = Regex::new(
        r"(\d+:)?(\d+):(\d+)[.,](\d+)\s*-->\s*(\d+:)?(\d+):(\d+)[.,](\d+)",
    )
    .expect("static regex");

    parse_blocks(&cleaned, &ts, |captures| {
        let start = ts_to_seconds(
            captures.get(1).map(|m| m.as_str()),
            &captures[2],
            &captures[3],
            &captures[4],
        );
        let end = ts_to_seconds(
            captures.get(5).map(|m| m.as_str()),
            &captures[6],
            &captures[7],
            &captures[8],
        );
        (start, end)
    })
}

/// Parse SRT subtitle content.
pub fn parse_srt(text: &str) -> Vec<TranscriptSegment> {
    let ts = Regex::new(r"(\d+):(\d+):(\d+)[.,](\d+)\s*-->\s*(\d+):(\d+):(\d+)[.,](\d+)")
        .expect("static regex");

    parse_blocks(text, &ts, |captures| {
        let start = ts_to_seconds(
            Some(&captures[1]),
            &captures[2],
            &captures[3],
            &captures[4],
        );
        let end = ts_to_seconds(
            Some(&captures[5]),
            &captures[6],
            &captures[7],
            &captures[8],
        );
        (start, end)
    })
}

fn parse_blocks(
    text: &str,
    ts: &Regex,
    to_times: impl Fn(&regex::Captures<'_>) -> (f64, f64),
) -> Vec<TranscriptSegment> {
    let splitter = Regex::new(r"\n\s*\n").expect("static regex");
    let tags = Regex::new(r"<[^>]+>").expect("static regex");

    let mut segments = Vec::new();
    for block in splitter.split(text.trim()) {
        let lines: Vec<&str> = block.trim().lines().collect();
        if lines.len() < 2 {
            continue;
        }

        let mut ts_line = None;
        let mut text_lines = Vec::new();
        for line in &lines {
            if line.contains("-->") {
                ts_line = Some(*line);
            } else if ts_line.is_some() {
                let clean = tags.replace_all(line, "");
                let clean = clean.trim();
                if !clean.is_empty() {
                    text_lines.push(clean.to_string());
                }
            }
        }

        let (Some(ts_line), false) = (ts_line, text_lines.is_empty()) else {
            continue;
        };
        if let Some(captures) = ts.captures(ts_line) {
            let (start, end) = to_times(&captures);
            segments.push(TranscriptSegment {
                start,
                end,
                text: text_lines.join(" "),
            });
        }
    }
    segments
}

fn ts_to_seconds(hours: Option<&str>, minutes: &str, seconds: &str, millis: &str) -> f64 {
    let hours: f64 = hours
        .map(|h| h.trim_end_matches(':'))
        .and_then(|h| h.parse().ok())
        .unwrap_or(0.0);
    let minutes: f64 = minutes.parse().unwrap_or(0.0);
    let seconds: f64 = seconds.parse().unwrap_or(0.0);
    let millis: f64 = format!("{:0<3}", millis)[..3].parse().unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds + millis / 1000.0
}

/// De-duplicate overlapping auto-caption lines.
///
/// Auto-generated captions repeat lines as they scroll; identical or
/// substring-overlapping consecutive segments are merged.
pub fn deduplicate(segments: Vec<TranscriptSegment>) -> Vec<TranscriptSegment> {
    let mut deduped: Vec<TranscriptSegment> = Vec::new();
    for segment in segments {
        let Some(prev) = deduped.last_mut() else {
            deduped.push(segment);
            continue;
        };
        if segment.text == prev.text {
            prev.end = prev.end.max(segment.end);
            continue;
        }
        if prev.text.contains(&segment.text) {
            continue;
        }
        // Progressive reveal: the new line extends the previous one.
        if segment.text.contains(&prev.text) {
            prev.text = segment.text;
            prev.end = segment.end;
            continue;
        }
        deduped.push(segment);
    }
    deduped
}
