/// Keyword classification of property documents and the analysis priority table.
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::ParsedDocument;

/// Text beyond this many bytes is not scanned for classification keywords.
const CLASSIFY_SCAN_BYTES: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    Ta6,
    Survey,
    Search,
    Title,
    Lease,
    Epc,
    General,
}

/// Checked in order; the first type with a matching keyword wins.
const RULES: &[(DocumentType, &[&str])] = &[
    (
        DocumentType::Ta6,
        &[
            "ta6",
            "property information form",
            "seller's property information",
            "sellers property information",
        ],
    ),
    (
        DocumentType::Survey,
        &[
            "survey",
            "surveyor",
            "homebuyer report",
            "building survey",
            "condition report",
            "rics",
        ],
    ),
    (
        DocumentType::Search,
        &[
            "search",
            "searches",
            "local authority",
            "con29",
            "llc1",
            "drainage and water",
            "environmental report",
        ],
    ),
    (
        DocumentType::Title,
        &[
            "title register",
            "title plan",
            "title number",
            "land registry",
            "official copy",
        ],
    ),
    (
        DocumentType::Lease,
        &["lease", "leasehold", "lessee", "lessor", "ground rent", "service charge"],
    ),
    (
        DocumentType::Epc,
        &[
            "epc",
            "energy performance certificate",
            "energy performance",
            "energy efficiency rating",
        ],
    ),
];

impl DocumentType {
    /// Position in the analysis order; lower runs first.
    pub fn priority(&self) -> u8 {
        match self {
            DocumentType::Ta6 => 0,
            DocumentType::Survey => 1,
            DocumentType::Search => 2,
            DocumentType::Title => 3,
            DocumentType::Lease => 4,
            DocumentType::Epc => 5,
            DocumentType::General => 6,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentType::Ta6 => "TA6 property information form",
            DocumentType::Survey => "property survey",
            DocumentType::Search => "conveyancing search",
            DocumentType::Title => "title register",
            DocumentType::Lease => "lease",
            DocumentType::Epc => "energy performance certificate",
            DocumentType::General => "property document",
        }
    }
}

/// Filename keywords are checked across all rules before the text is considered, so a
/// survey that mentions "searches" in passing is still a survey.
pub fn classify(document: &ParsedDocument) -> DocumentType {
    let filename = normalize(&document.filename);
    if let Some(kind) = match_rules(&filename) {
        return kind;
    }
    let end = floor_char_boundary(&document.text, CLASSIFY_SCAN_BYTES);
    let text = document.text[..end].to_lowercase();
    match_rules(&text).unwrap_or(DocumentType::General)
}

/// Stable ordering by type priority; ties keep input order.
pub fn prioritize(documents: &[ParsedDocument]) -> Vec<(&ParsedDocument, DocumentType)> {
    let mut typed: Vec<_> = documents.iter().map(|d| (d, classify(d))).collect();
    typed.sort_by_key(|(_, kind)| kind.priority());
    typed
}

fn match_rules(haystack: &str) -> Option<DocumentType> {
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| contains_word(haystack, kw)))
        .map(|(kind, _)| *kind)
}

/// Filenames use `_`, `-` and `.` as separators.
fn normalize(filename: &str) -> String {
    filename
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '.') { ' ' } else { c })
        .collect()
}

/// Substring match that only accepts hits bounded by non-alphanumeric characters.
fn contains_word(haystack: &str, word: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(word) {
        let start = from + pos;
        let end = start + word.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if max >= text.len() {
        return text.len();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}
