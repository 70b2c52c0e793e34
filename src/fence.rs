//! Fenced code block scanner for streamed markdown.
//!
//! The scanner is a pure function of a text snapshot. It is re-run on every
//! streamed fragment, so it never assumes the final fence has closed: an
//! unterminated trailing fence yields a block with `closed == false`.
//!
//! ```
//! use intelliagent::fence::{scan, Segment};
//!
//! let segments = scan("Here:\n```html\n<p>hi</p>\n```\n- done");
//! assert_eq!(segments.len(), 3);
//! let Segment::Code(block) = &segments[1] else { unreachable!() };
//! assert_eq!(block.language, "html");
//! assert!(block.closed);
//! ```

use serde::{Deserialize, Serialize};

const FENCE: &str = "```";

/// A fenced code block detected in a text snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Language tag from the opening fence line, trimmed. May be empty.
    pub language: String,
    /// Body of the block, trimmed.
    pub code: String,
    /// Whether the closing fence has arrived.
    pub closed: bool,
}

impl CodeBlock {
    pub fn is_previewable(&self) -> bool {
        is_previewable_language(&self.language)
    }
}

/// A run of prose between code blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProseRun {
    Paragraph(String),
    /// Consecutive `* ` / `- ` lines, markers stripped.
    Bullets(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Prose(Vec<ProseRun>),
    Code(CodeBlock),
}

/// Only markup can be rendered as a live preview.
pub fn is_previewable_language(language: &str) -> bool {
    language.trim().eq_ignore_ascii_case("html")
}

/// Split `text` into prose and code segments.
pub fn scan(text: &str) -> Vec<Segment> {
    let pieces: Vec<&str> = text.split(FENCE).collect();
    let last = pieces.len().saturating_sub(1);
    let mut segments = Vec::with_capacity(pieces.len());

    for (index, piece) in pieces.iter().enumerate() {
        if index % 2 == 1 {
            segments.push(Segment::Code(parse_code(piece, index < last)));
        } else {
            let runs = parse_prose(piece);
            if !runs.is_empty() {
                segments.push(Segment::Prose(runs));
            }
        }
    }
    segments
}

/// Only the code blocks of `text`, in order.
pub fn code_blocks(text: &str) -> Vec<CodeBlock> {
    let pieces: Vec<&str> = text.split(FENCE).collect();
    let last = pieces.len().saturating_sub(1);
    pieces
        .iter()
        .enumerate()
        .filter(|(index, _)| index % 2 == 1)
        .map(|(index, piece)| parse_code(piece, index < last))
        .collect()
}

/// The last previewable block with a non-empty body, closed or not.
pub fn latest_preview(text: &str) -> Option<CodeBlock> {
    code_blocks(text)
        .into_iter()
        .rev()
        .find(|block| block.is_previewable() && !block.code.is_empty())
}

fn parse_code(piece: &str, closed: bool) -> CodeBlock {
    let (language, body) = piece.split_once('\n').unwrap_or((piece, ""));
    CodeBlock {
        language: language.trim().to_owned(),
        code: body.trim().to_owned(),
        closed,
    }
}

fn parse_prose(piece: &str) -> Vec<ProseRun> {
    let mut runs = Vec::new();
    let mut bullets: Vec<String> = Vec::new();

    for line in piece.trim().lines() {
        let trimmed = line.trim();
        if let Some(item) = trimmed
            .strip_prefix("* ")
            .or_else(|| trimmed.strip_prefix("- "))
        {
            bullets.push(item.to_owned());
            continue;
        }
        if !bullets.is_empty() {
            runs.push(ProseRun::Bullets(std::mem::take(&mut bullets)));
        }
        if !trimmed.is_empty() {
            runs.push(ProseRun::Paragraph(trimmed.to_owned()));
        }
    }
    if !bullets.is_empty() {
        runs.push(ProseRun::Bullets(bullets));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Intro line\n\n* one\n- two\nAfter list\n```html\n<h1>Hi</h1>\n```\nThen python:\n```Python\nprint('x')\n```\n";

    #[test]
    fn splits_prose_and_code() {
        let segments = scan(SAMPLE);
        assert_eq!(
            segments[0],
            Segment::Prose(vec![
                ProseRun::Paragraph("Intro line".into()),
                ProseRun::Bullets(vec!["one".into(), "two".into()]),
                ProseRun::Paragraph("After list".into()),
            ])
        );
        assert_eq!(
            segments[1],
            Segment::Code(CodeBlock {
                language: "html".into(),
                code: "<h1>Hi</h1>".into(),
                closed: true,
            })
        );
        assert_eq!(
            segments[2],
            Segment::Prose(vec![ProseRun::Paragraph("Then python:".into())])
        );
        assert!(matches!(&segments[3], Segment::Code(b) if b.language == "Python" && b.closed));
        assert_eq!(segments.len(), 4);
    }

    #[test]
    fn unterminated_fence_is_open_block() {
        let blocks = code_blocks("text\n```html\n<div>");
        assert_eq!(
            blocks,
            vec![CodeBlock {
                language: "html".into(),
                code: "<div>".into(),
                closed: false,
            }]
        );
    }

    #[test]
    fn bare_opening_fence_has_empty_language() {
        let blocks = code_blocks("look ```");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "");
        assert_eq!(blocks[0].code, "");
        assert!(!blocks[0].closed);
    }

    #[test]
    fn every_prefix_is_safe_and_closed_languages_are_stable() {
        let mut closed_seen: Vec<String> = Vec::new();
        let boundaries: Vec<usize> = SAMPLE
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(SAMPLE.len()))
            .collect();
        for end in boundaries {
            let prefix = &SAMPLE[..end];
            let _ = scan(prefix);
            let closed: Vec<String> = code_blocks(prefix)
                .into_iter()
                .filter(|b| b.closed)
                .map(|b| b.language)
                .collect();
            assert!(closed.len() >= closed_seen.len(), "closed block vanished at {end}");
            assert_eq!(&closed[..closed_seen.len()], &closed_seen[..]);
            closed_seen = closed;
        }
        assert_eq!(closed_seen, vec!["html".to_owned(), "Python".to_owned()]);
    }

    #[test]
    fn scanning_handles_multibyte_and_odd_input() {
        for text in ["", "```", "``````", "é```ü\n```", "-", "* ", "\n\n\n"] {
            let _ = scan(text);
            let _ = code_blocks(text);
        }
    }

    #[test]
    fn previewable_is_case_insensitive() {
        assert!(is_previewable_language("HTML"));
        assert!(is_previewable_language(" html "));
        assert!(!is_previewable_language("htm"));
        assert!(!is_previewable_language("javascript"));
    }

    #[test]
    fn latest_preview_prefers_last_nonempty_html() {
        let text = "```html\n<p>old</p>\n```\n```css\nbody{}\n```\n```html\n<p>new";
        let block = latest_preview(text);
        assert_eq!(block.map(|b| b.code), Some("<p>new".to_owned()));
        assert!(latest_preview("```html\n").is_none());
        assert!(latest_preview("no code").is_none());
    }
}
