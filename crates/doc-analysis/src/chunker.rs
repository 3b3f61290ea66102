/// Citation-addressable chunking of extracted document text.
///
/// A fixed-size window (~500 bytes) slides over the text with ~50 bytes of overlap.
/// Window ends snap back to the last newline (or space) inside the window, so any line
/// shorter than the window lands whole in at least one chunk.
///
/// Each chunk records where it starts: page (from `Page N` / `- N -` marker lines and
/// form feeds), 1-based line number and the nearest preceding section header.
/// Chunk confidence is copied from the parent document's extraction quality.
use regex::Regex;

use crate::model::{DocumentChunk, ParsedDocument};

pub const TARGET_CHUNK_SIZE: usize = 500;
pub const CHUNK_OVERLAP: usize = 50;

const MAX_HEADER_LEN: usize = 80;

pub fn chunk(document: &ParsedDocument) -> Vec<DocumentChunk> {
    chunk_with(document, TARGET_CHUNK_SIZE, CHUNK_OVERLAP)
}

pub fn chunk_with(document: &ParsedDocument, target: usize, overlap: usize) -> Vec<DocumentChunk> {
    let text = document.text.as_str();
    if text.trim().is_empty() {
        return Vec::new();
    }
    let target = target.max(1);
    let overlap = overlap.min(target / 2);

    let index = TextIndex::build(text);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut previous_end = 0usize;

    loop {
        let mut hard_end = snap_to_char_boundary(text, (start + target).min(text.len()));
        if hard_end <= start {
            hard_end = next_char_boundary(text, start);
        }
        let end = if hard_end >= text.len() {
            text.len()
        } else {
            break_point(text, start, hard_end, previous_end)
        };

        let content = &text[start..end];
        if !content.trim().is_empty() {
            chunks.push(DocumentChunk {
                id: format!("{}-chunk-{}", document.id, chunks.len()),
                document_id: document.id.clone(),
                content: content.to_string(),
                start_offset: start,
                end_offset: end,
                page_number: index.page_at(start),
                line_number: index.line_at(start),
                section_title: index.section_at(start),
                confidence: document.quality.confidence,
            });
        }

        if end >= text.len() {
            break;
        }
        previous_end = end;
        let next = if end - start > overlap {
            snap_to_char_boundary(text, end - overlap)
        } else {
            end
        };
        start = if next > start { next } else { end };
    }

    chunks
}

/// Section-header heuristic: a short line that is mostly uppercase, ends with a colon,
/// or starts with an ordinal such as `1.`, `2.3`, `(a)` or `IV.` (see [`ordinal_regex`]).
pub fn is_section_header(line: &str, ordinal_re: &Regex) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_HEADER_LEN {
        return false;
    }
    if trimmed.ends_with(':') {
        return true;
    }

    let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 3 {
        let upper = letters.iter().filter(|c| c.is_uppercase()).count();
        if upper * 2 > letters.len() {
            return true;
        }
    }

    ordinal_re.is_match(trimmed) && letters.len() >= 3
}

pub fn ordinal_regex() -> Regex {
    Regex::new(r"^(?:\d+(?:\.\d+)*[.)]?|\([a-z0-9]{1,3}\)|[IVXLC]{1,6}\.)\s+\S")
        .expect("valid regex")
}

/// Where an excerpt was found in a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExcerptMatch {
    pub offset: usize,
    pub page: u32,
    pub line: u32,
    pub section: Option<String>,
    /// Whitespace-collapsed text surrounding the match.
    pub context: String,
}

pub const CONTEXT_RADIUS: usize = 120;

/// Locate `excerpt` in `text` by ASCII case-insensitive substring search. The first
/// (lowest offset) occurrence wins; the covering chunk supplies page and section.
pub fn locate_excerpt(text: &str, chunks: &[DocumentChunk], excerpt: &str) -> Option<ExcerptMatch> {
    let needle = excerpt.trim();
    if needle.is_empty() {
        return None;
    }
    let offset = text
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())?;

    Some(match_at(text, chunks, offset, needle.len()))
}

/// Location of the `len` bytes at `offset`; the covering chunk supplies page and section.
pub fn match_at(text: &str, chunks: &[DocumentChunk], offset: usize, len: usize) -> ExcerptMatch {
    let chunk = chunks
        .iter()
        .find(|c| c.start_offset <= offset && offset < c.end_offset);
    let (page, line, section) = match chunk {
        Some(c) => {
            let newlines = text[c.start_offset..offset].matches('\n').count() as u32;
            (c.page_number, c.line_number + newlines, c.section_title.clone())
        }
        None => (1, text[..offset].matches('\n').count() as u32 + 1, None),
    };

    ExcerptMatch {
        offset,
        page,
        line,
        section,
        context: context_around(text, offset, len),
    }
}

pub fn context_around(text: &str, offset: usize, len: usize) -> String {
    let from = snap_to_char_boundary(text, offset.saturating_sub(CONTEXT_RADIUS));
    let to = snap_to_char_boundary(text, (offset + len + CONTEXT_RADIUS).min(text.len()));
    text[from..to].split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Precomputed offsets for locating pages, lines and sections.
struct TextIndex {
    line_starts: Vec<usize>,
    pages: Vec<(usize, u32)>,
    sections: Vec<(usize, String)>,
}

impl TextIndex {
    fn build(text: &str) -> Self {
        let page_re = Regex::new(
            r"(?i)^\s*(?:-\s*(\d{1,4})\s*-|page\s+(\d{1,4})(?:\s+of\s+\d{1,4})?)\s*$",
        )
        .expect("valid regex");
        let ordinal_re = ordinal_regex();

        let mut line_starts = vec![0usize];
        let mut pages: Vec<(usize, u32)> = Vec::new();
        let mut sections: Vec<(usize, String)> = Vec::new();
        let mut current_page = 1u32;

        let mut offset = 0usize;
        for line in text.split_inclusive('\n') {
            let line_start = offset;
            offset += line.len();
            if offset < text.len() {
                line_starts.push(offset);
            }

            // A form feed starts a new page wherever it appears in the line.
            for (i, _) in line.match_indices('\u{c}') {
                current_page += 1;
                pages.push((line_start + i, current_page));
            }

            let body = line.trim_end_matches(['\n', '\r']).trim_matches('\u{c}');
            if let Some(caps) = page_re.captures(body) {
                let number = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .and_then(|m| m.as_str().parse::<u32>().ok());
                if let Some(n) = number {
                    current_page = n;
                    pages.push((line_start, n));
                }
                continue;
            }

            if is_section_header(body, &ordinal_re) {
                let title = body.trim().trim_end_matches(':').trim().to_string();
                if !title.is_empty() {
                    sections.push((line_start, title));
                }
            }
        }

        Self {
            line_starts,
            pages,
            sections,
        }
    }

    fn page_at(&self, offset: usize) -> u32 {
        self.pages
            .iter()
            .take_while(|(at, _)| *at <= offset)
            .last()
            .map(|(_, page)| *page)
            .unwrap_or(1)
    }

    fn line_at(&self, offset: usize) -> u32 {
        let idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        idx as u32 + 1
    }

    fn section_at(&self, offset: usize) -> Option<String> {
        self.sections
            .iter()
            .take_while(|(at, _)| *at <= offset)
            .last()
            .map(|(_, title)| title.clone())
    }
}

/// Prefer ending the window after the last newline, then after the last space. A break
/// must land past `previous_end`, otherwise the window would only repeat overlap.
fn break_point(text: &str, start: usize, hard_end: usize, previous_end: usize) -> usize {
    let window = &text[start..hard_end];
    let usable = |pos: &usize| *pos > 0 && start + pos + 1 > previous_end;
    window
        .rfind('\n')
        .filter(usable)
        .or_else(|| window.rfind(' ').filter(usable))
        .map(|pos| start + pos + 1)
        .unwrap_or(hard_end)
}

fn snap_to_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn next_char_boundary(text: &str, idx: usize) -> usize {
    text[idx..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| idx + i)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentMetadata, DocumentQuality, QualityTier};

    fn doc(text: &str, confidence: f64) -> ParsedDocument {
        ParsedDocument {
            id: "doc-1".to_string(),
            filename: "survey.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: text.len() as u64,
            text: text.to_string(),
            quality: DocumentQuality {
                confidence,
                tier: QualityTier::Medium,
                issues: vec![],
                recommendations: vec![],
            },
            metadata: DocumentMetadata::default(),
        }
    }

    fn long_text() -> String {
        let mut text = String::from("SCHEDULE OF CONDITION\n");
        for i in 0..60 {
            if i == 20 {
                text.push_str("Page 2\n");
                text.push_str("2. Roof Coverings\n");
            }
            text.push_str(&format!(
                "Line {i}: the surveyor noted item {i} during the inspection.\n"
            ));
        }
        text
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk(&doc("", 0.9)).is_empty());
        assert!(chunk(&doc("  \n\n \t", 0.9)).is_empty());
    }

    #[test]
    fn short_document_yields_one_chunk() {
        let chunks = chunk(&doc("A short note.", 0.8));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "A short note.");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 13);
        assert_eq!(chunks[0].page_number, 1);
        assert_eq!(chunks[0].line_number, 1);
    }

    #[test]
    fn every_non_empty_line_is_covered() {
        let text = long_text();
        let chunks = chunk(&doc(&text, 0.7));
        assert!(chunks.len() > 1);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            assert!(
                chunks.iter().any(|c| c.content.contains(line)),
                "line not covered: {line}"
            );
        }
    }

    #[test]
    fn offsets_cover_text_with_overlap() {
        let text = long_text();
        let chunks = chunk(&doc(&text, 0.7));
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks.last().unwrap().end_offset, text.len());
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset <= pair[0].end_offset);
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
        for c in &chunks {
            assert_eq!(&text[c.start_offset..c.end_offset], c.content);
            assert!(c.content.len() <= TARGET_CHUNK_SIZE);
        }
    }

    #[test]
    fn chunks_inherit_document_confidence() {
        let chunks = chunk(&doc(&long_text(), 0.42));
        assert!(chunks.iter().all(|c| c.confidence == 0.42));
        assert!(chunks.iter().all(|c| c.document_id == "doc-1"));
    }

    #[test]
    fn pages_lines_and_sections_are_tracked() {
        let chunks = chunk(&doc(&long_text(), 0.7));
        assert_eq!(chunks[0].section_title.as_deref(), Some("SCHEDULE OF CONDITION"));
        let last = chunks.last().unwrap();
        assert_eq!(last.page_number, 2);
        assert_eq!(last.section_title.as_deref(), Some("2. Roof Coverings"));
        assert!(last.line_number > 20);
    }

    #[test]
    fn form_feed_advances_page() {
        let text = format!("first page\n\u{c}second page {}\n", "x".repeat(10));
        let index = TextIndex::build(&text);
        assert_eq!(index.page_at(0), 1);
        assert_eq!(index.page_at(text.find("second").unwrap()), 2);
    }

    #[test]
    fn header_heuristic() {
        let re = ordinal_regex();
        assert!(is_section_header("PROPERTY INFORMATION", &re));
        assert!(is_section_header("Boundaries:", &re));
        assert!(is_section_header("3.2 Drainage and water", &re));
        assert!(is_section_header("IV. Covenants", &re));
        assert!(!is_section_header("The roof is in fair condition overall.", &re));
        assert!(!is_section_header("", &re));
        assert!(!is_section_header(&"A".repeat(120), &re));
    }

    #[test]
    fn long_line_after_overlap_newline_does_not_repeat_overlap() {
        // newline at byte 460 falls inside the next window's overlap
        let text = format!("{}\n{}", "a".repeat(460), "word ".repeat(140));
        let chunks = chunk_with(&doc(&text, 0.8), TARGET_CHUNK_SIZE, CHUNK_OVERLAP);

        assert_eq!(chunks[0].end_offset, 461);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].end_offset > pair[0].end_offset,
                "chunk {} ends inside {}",
                pair[1].id,
                pair[0].id
            );
            assert!(pair[1].start_offset <= pair[0].end_offset);
        }
        assert_eq!(chunks.last().unwrap().end_offset, text.len());
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "é".repeat(700);
        let chunks = chunk_with(&doc(&text, 0.5), 101, 11);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.last().unwrap().end_offset, text.len());
    }

    #[test]
    fn excerpts_are_located_case_insensitively() {
        let text = long_text();
        let document = doc(&text, 0.7);
        let chunks = chunk(&document);
        let found = locate_excerpt(&text, &chunks, "  LINE 45: the surveyor noted item 45 ").unwrap();
        assert_eq!(found.offset, text.find("Line 45:").unwrap());
        assert_eq!(found.page, 2);
        assert_eq!(found.section.as_deref(), Some("2. Roof Coverings"));
        let expected_line = text[..found.offset].matches('\n').count() as u32 + 1;
        assert_eq!(found.line, expected_line);
        assert!(found.context.contains("Line 45:"));
        assert!(!found.context.contains('\n'));

        assert!(locate_excerpt(&text, &chunks, "not in the document").is_none());
        assert!(locate_excerpt(&text, &chunks, "   ").is_none());
    }

    #[test]
    fn first_match_wins() {
        let text = "flood risk noted.\nLater: flood risk repeated.";
        let document = doc(text, 0.9);
        let chunks = chunk(&document);
        let found = locate_excerpt(text, &chunks, "flood risk").unwrap();
        assert_eq!(found.offset, 0);
        assert_eq!(found.line, 1);
    }
}
