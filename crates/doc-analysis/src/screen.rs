/// Deterministic hazard screen run alongside detailed analysis.
///
/// A fixed keyword table flags hazards that lenders and insurers treat as serious
/// regardless of what the model reports. These are the only findings raised at
/// `Severity::Critical`.
use crate::chunker::{self, ExcerptMatch};
use crate::model::{
    now_millis, new_id, Citation, CitationLocation, DocumentChunk, Finding, FindingType,
    ParsedDocument, Severity,
};

/// How far before a match to look for a negation such as "no evidence of".
const NEGATION_WINDOW: usize = 48;
const NEGATIONS: &[&str] = &["no ", "not ", "none", "free from", "nil ", "without "];
const MAX_SCREEN_CONFIDENCE: f64 = 0.9;

struct Hazard {
    keyword: &'static str,
    title: &'static str,
    description: &'static str,
    recommendation: &'static str,
}

const HAZARDS: &[Hazard] = &[
    Hazard {
        keyword: "japanese knotweed",
        title: "Japanese knotweed reported",
        description: "The document refers to Japanese knotweed. It can affect mortgage \
availability and insurance and usually needs a professional treatment plan.",
        recommendation: "Obtain a specialist knotweed survey and an insurance-backed treatment plan",
    },
    Hazard {
        keyword: "subsidence",
        title: "Subsidence referenced",
        description: "The document refers to subsidence. Ongoing ground movement can cause \
structural damage and make buildings insurance hard to obtain.",
        recommendation: "Ask a structural engineer to assess movement and check the insurance claims history",
    },
    Hazard {
        keyword: "flood zone 3",
        title: "Property in flood zone 3",
        description: "The document places the property in flood zone 3, the highest flood \
risk category.",
        recommendation: "Get flood insurance quotes and a flood risk report before exchange",
    },
    Hazard {
        keyword: "asbestos",
        title: "Asbestos referenced",
        description: "The document refers to asbestos-containing materials, which must be \
managed or removed by licensed contractors if disturbed.",
        recommendation: "Commission an asbestos survey and price any removal before exchange",
    },
    Hazard {
        keyword: "contaminated land",
        title: "Contaminated land referenced",
        description: "The document refers to contaminated land. Remediation liability can \
fall on the owner.",
        recommendation: "Ask your solicitor to review the environmental report and liability position",
    },
    Hazard {
        keyword: "dangerous structure",
        title: "Dangerous structure notice",
        description: "The document refers to a dangerous structure, which may carry \
enforcement action and urgent repair costs.",
        recommendation: "Ask the local authority for the notice and the status of any required works",
    },
];

/// One critical red flag per hazard whose keyword appears un-negated in the text.
pub fn screen(document: &ParsedDocument, chunks: &[DocumentChunk]) -> Vec<Finding> {
    let confidence = document.quality.confidence.clamp(0.0, MAX_SCREEN_CONFIDENCE);
    HAZARDS
        .iter()
        .filter_map(|hazard| {
            let found = first_unnegated(&document.text, chunks, hazard.keyword)?;
            Some(hazard_finding(document, hazard, found, confidence))
        })
        .collect()
}

fn first_unnegated(text: &str, chunks: &[DocumentChunk], keyword: &str) -> Option<ExcerptMatch> {
    let lower = text.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(keyword) {
        let offset = from + pos;
        if !is_negated(&lower, offset) {
            return Some(chunker::match_at(text, chunks, offset, keyword.len()));
        }
        from = offset + keyword.len();
    }
    None
}

fn is_negated(lower: &str, offset: usize) -> bool {
    let mut start = offset.saturating_sub(NEGATION_WINDOW);
    while !lower.is_char_boundary(start) {
        start += 1;
    }
    let window = &lower[start..offset];
    // Only the current sentence counts.
    let sentence = window.rsplit(['.', '\n']).next().unwrap_or(window);
    NEGATIONS.iter().any(|n| sentence.contains(n))
}

fn hazard_finding(
    document: &ParsedDocument,
    hazard: &Hazard,
    found: ExcerptMatch,
    confidence: f64,
) -> Finding {
    let excerpt = document.text[found.offset..found.offset + hazard.keyword.len()].to_string();
    Finding {
        id: new_id("finding", &format!("{}:{}", document.id, hazard.keyword)),
        kind: FindingType::RedFlag,
        title: hazard.title.to_string(),
        description: hazard.description.to_string(),
        severity: Severity::Critical,
        confidence,
        citations: vec![Citation {
            document_id: document.id.clone(),
            document_name: document.filename.clone(),
            location: CitationLocation {
                page: Some(found.page),
                line: Some(found.line),
                section: found.section,
            },
            excerpt,
            confidence,
            context: found.context,
        }],
        recommendations: vec![hazard.recommendation.to_string()],
        professional_advice_required: true,
        created_at: now_millis(),
    }
}
