/// Prompt construction for document analysis and buyer question generation.
use std::fmt::Write;

use crate::classify::DocumentType;
use crate::model::{Finding, ParsedDocument, RiskTolerance, TimelineUrgency, UserContext};

pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 15_000;

pub const ANALYSIS_PERSONA: &str = "You are an experienced UK conveyancing solicitor and \
chartered surveyor reviewing documents on behalf of a residential property buyer. \
You are precise, you never invent facts, and every point you raise must be supported by \
a verbatim quote from the document you are given. Report findings only through the \
provided function.";

pub const QUESTIONS_PERSONA: &str = "You are an experienced UK conveyancing solicitor \
helping a property buyer prepare questions for their solicitor, surveyor, lender or the \
seller. Questions must be specific, answerable and tied to the findings you are given. \
Respond only through the provided function.";

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub max_document_chars: usize,
    /// Upper bound on findings the model should report; `None` leaves it open.
    pub max_findings: Option<usize>,
    pub include_confidence: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            max_findings: None,
            include_confidence: true,
        }
    }
}

pub fn focus_points(kind: DocumentType) -> &'static [&'static str] {
    match kind {
        DocumentType::Ta6 => &[
            "Boundary disputes, complaints or changes to boundaries",
            "Notices, planning applications or proposals affecting the property or neighbours",
            "Alterations, extensions or works without planning or building regulations approval",
            "Guarantees and warranties that are missing, expired or not transferable",
            "Flooding, radon, invasive plants or environmental issues disclosed by the seller",
            "Shared services, rights of way and access arrangements",
        ],
        DocumentType::Survey => &[
            "Structural movement, cracking or subsidence",
            "Condition ratings of 3 and items needing urgent repair",
            "Damp, timber decay, roof and drainage defects",
            "Electrical, gas and heating installations needing testing",
            "Further investigations the surveyor recommends before exchange",
        ],
        DocumentType::Search => &[
            "Planning history, enforcement notices and building control entries",
            "Road adoption, highway schemes and rail proposals",
            "Environmental risks: flood, contaminated land, radon, ground stability",
            "Drainage and water connections, public sewers within the boundary",
            "Local land charges and financial charges registered against the property",
        ],
        DocumentType::Title => &[
            "Tenure and class of title",
            "Restrictive covenants and positive obligations",
            "Easements, rights of way and rights reserved to others",
            "Charges, restrictions and notices on the register",
            "Discrepancies between the title plan and the physical boundaries",
        ],
        DocumentType::Lease => &[
            "Unexpired term and any lease extension concerns",
            "Ground rent level and review clauses, especially doubling provisions",
            "Service charge, reserve fund and major works liabilities",
            "Repairing obligations and restrictions on alterations, subletting or pets",
            "Forfeiture clauses and consent requirements",
        ],
        DocumentType::Epc => &[
            "Current and potential energy efficiency ratings",
            "Minimum energy efficiency standards if the property will be let",
            "Recommended improvements and their indicative cost",
            "Heating system type and estimated running costs",
        ],
        DocumentType::General => &[
            "Legal, financial or physical risks to the buyer",
            "Obligations or costs that pass to the buyer",
            "Information that should be verified with the seller or professionals",
        ],
    }
}

/// Cap `text` at `max_chars` characters. Returns the kept prefix and whether anything
/// was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => (&text[..byte], true),
        None => (text, false),
    }
}

pub fn build_analysis_prompt(
    document: &ParsedDocument,
    kind: DocumentType,
    context: &UserContext,
    options: &PromptOptions,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Review the following {} (\"{}\") for a property buyer.",
        kind.label(),
        document.filename
    );

    prompt.push_str("\nFocus on:\n");
    for point in focus_points(kind) {
        let _ = writeln!(prompt, "- {point}");
    }

    prompt.push_str("\nBuyer context:\n");
    for line in context_lines(context) {
        let _ = writeln!(prompt, "- {line}");
    }

    prompt.push_str("\nOutput rules:\n");
    prompt.push_str("- type must be one of: positive, concern, risk, red_flag.\n");
    prompt.push_str("- severity must be one of: low, medium, high. No other value is accepted.\n");
    prompt.push_str(
        "- Every finding needs at least one citation whose quote is copied verbatim from the document.\n",
    );
    if options.include_confidence {
        prompt.push_str(
            "- confidence is a number between 0 and 1 reflecting how clearly the document supports the finding.\n",
        );
    } else {
        prompt.push_str("- confidence may be omitted.\n");
    }
    if let Some(max) = options.max_findings {
        let _ = writeln!(
            prompt,
            "- This is a quick first pass: report at most {max} findings, the most important first."
        );
    }
    if document.quality.confidence < 0.6 {
        prompt.push_str(
            "- The text was extracted with low confidence; treat garbled passages with caution.\n",
        );
    }

    let (text, truncated) = truncate_chars(&document.text, options.max_document_chars);
    prompt.push_str("\nDocument text:\n<<<\n");
    prompt.push_str(text);
    prompt.push_str("\n>>>\n");
    if truncated {
        let _ = writeln!(
            prompt,
            "(Document truncated to the first {} characters.)",
            options.max_document_chars
        );
    }
    prompt
}

pub fn build_questions_prompt(findings: &[Finding], context: &UserContext) -> String {
    let mut prompt = String::from(
        "Draft the questions this buyer should ask before exchange of contracts, \
based on these findings:\n",
    );
    for finding in findings {
        let _ = writeln!(
            prompt,
            "- [{}] {} ({}, severity {:?}): {}",
            finding.id,
            finding.title,
            finding.kind.as_str(),
            finding.severity,
            finding.description
        );
    }

    prompt.push_str("\nBuyer context:\n");
    for line in context_lines(context) {
        let _ = writeln!(prompt, "- {line}");
    }

    prompt.push_str("\nOutput rules:\n");
    prompt.push_str(
        "- category must be one of: legal, structural, financial, environmental, other.\n",
    );
    prompt.push_str("- priority must be one of: high, medium, low. No other value is accepted.\n");
    prompt.push_str("- relatedFindings lists the ids in square brackets above that the question addresses.\n");
    prompt
}

fn context_lines(context: &UserContext) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(
        match context.risk_tolerance {
            RiskTolerance::Low => "Risk tolerance: low. Flag even minor issues.",
            RiskTolerance::Medium => "Risk tolerance: medium.",
            RiskTolerance::High => {
                "Risk tolerance: high. Concentrate on material issues and skip cosmetic ones."
            }
        }
        .to_string(),
    );
    lines.push(
        match context.timeline {
            TimelineUrgency::Flexible => "Timeline: flexible.",
            TimelineUrgency::Standard => "Timeline: standard.",
            TimelineUrgency::Urgent => {
                "Timeline: urgent. Highlight anything likely to delay exchange or completion."
            }
        }
        .to_string(),
    );
    if context.first_time_buyer {
        lines.push("First-time buyer: explain technical terms in plain English.".to_string());
    }
    lines.push(if context.has_solicitor {
        "The buyer has instructed a solicitor.".to_string()
    } else {
        "The buyer has not instructed a solicitor yet; say when legal advice is needed.".to_string()
    });
    lines.push(if context.has_surveyor {
        "The buyer has instructed a surveyor.".to_string()
    } else {
        "The buyer has not instructed a surveyor; say when a survey would help.".to_string()
    });
    if let Some(notes) = context.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        lines.push(format!("Buyer notes: {notes}"));
    }
    lines
}
