//! Reversible joining of string segments into one opaque key.
//!
//! Segments are joined with `/`. A literal `/` inside a segment is written
//! as `\/` and a literal `\` as `\\`, so no two segment lists share a key.

const SEPARATOR: char = '/';
const ESCAPE: char = '\\';

/// Joins segments into a single key
pub fn encode_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for (idx, segment) in segments.iter().enumerate() {
        if idx > 0 {
            out.push(SEPARATOR);
        }
        for ch in segment.as_ref().chars() {
            if ch == SEPARATOR || ch == ESCAPE {
                out.push(ESCAPE);
            }
            out.push(ch);
        }
    }
    out
}

/// Splits a key produced by [`encode_path`] back into its segments
pub fn decode_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => {
                // A trailing lone escape is kept literally.
                current.push(chars.next().unwrap_or(ESCAPE));
            }
            SEPARATOR => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}
