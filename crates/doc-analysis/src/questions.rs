/// Buyer questions derived from findings: the `generate_questions` function schema,
/// boundary normalization of its enum fields and the heuristic fallback set.
use std::collections::HashSet;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::AnalysisError;
use crate::model::{new_id, Finding, FindingType, Priority, Question, QuestionCategory, Severity};

pub const GENERATE_QUESTIONS_FN: &str = "generate_questions";
pub const GENERATE_QUESTIONS_DESCRIPTION: &str =
    "Return the questions a property buyer should ask about the findings.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct QuestionsPayload {
    #[schemars(with = "Vec<RawQuestion>")]
    pub questions: Vec<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawQuestion {
    pub category: QuestionCategory,
    pub question: String,
    pub priority: Priority,
    /// Why the buyer should ask it.
    #[serde(default)]
    pub context: String,
    /// Ids of the findings the question addresses.
    #[serde(default)]
    pub related_findings: Vec<String>,
}

const CATEGORIES: &[&str] = &["legal", "structural", "financial", "environmental", "other"];
const PRIORITIES: &[&str] = &["high", "medium", "low"];

/// Category outside the enum becomes `other`; priority `critical`/`urgent` becomes
/// `high` and anything else unknown becomes `medium`.
fn normalize_question_value(item: &mut Value) {
    let Some(obj) = item.as_object_mut() else {
        return;
    };

    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_lowercase())
        .filter(|c| CATEGORIES.contains(&c.as_str()))
        .unwrap_or_else(|| "other".to_string());
    obj.insert("category".into(), Value::String(category));

    let priority = obj
        .get("priority")
        .and_then(Value::as_str)
        .map(|p| p.trim().to_lowercase())
        .map(|p| match p.as_str() {
            "critical" | "urgent" => "high".to_string(),
            _ if PRIORITIES.contains(&p.as_str()) => p,
            _ => "medium".to_string(),
        })
        .unwrap_or_else(|| "medium".to_string());
    obj.insert("priority".into(), Value::String(priority));
}

pub fn decode_questions(arguments: &str, findings: &[Finding]) -> Result<Vec<Question>, AnalysisError> {
    let payload: QuestionsPayload = serde_json::from_str(arguments).map_err(|e| {
        AnalysisError::MalformedProviderResponse(format!("{GENERATE_QUESTIONS_FN} arguments: {e}"))
    })?;

    let known: HashSet<&str> = findings.iter().map(|f| f.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut questions = Vec::new();

    for mut item in payload.questions {
        normalize_question_value(&mut item);
        let raw: RawQuestion = match serde_json::from_value(item) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "dropping out-of-schema question");
                continue;
            }
        };
        let text = raw.question.trim();
        if text.is_empty() || !seen.insert(text.to_lowercase()) {
            continue;
        }
        questions.push(Question {
            id: new_id("question", text),
            category: raw.category,
            question: text.to_string(),
            priority: raw.priority,
            context: raw.context.trim().to_string(),
            related_findings: raw
                .related_findings
                .into_iter()
                .filter(|id| known.contains(id.as_str()))
                .collect(),
        });
    }

    questions.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(questions)
}

struct Heuristic {
    category: QuestionCategory,
    keywords: &'static [&'static str],
    question: &'static str,
    context: &'static str,
}

const HEURISTICS: &[Heuristic] = &[
    Heuristic {
        category: QuestionCategory::Structural,
        keywords: &["structur", "crack", "subsidence", "movement", "roof", "damp", "timber"],
        question: "Should I commission a structural engineer or specialist survey before exchange?",
        context: "Findings mention the condition or stability of the building.",
    },
    Heuristic {
        category: QuestionCategory::Financial,
        keywords: &["service charge", "ground rent", "cost", "fee", "price", "mortgage", "lender"],
        question: "What ongoing costs will I take on, and could any of them affect my mortgage offer?",
        context: "Findings mention charges or costs that pass to the buyer.",
    },
    Heuristic {
        category: QuestionCategory::Environmental,
        keywords: &["flood", "contaminat", "radon", "knotweed", "asbestos", "environmental"],
        question: "Do the environmental risks need specialist reports or insurance quotes before I commit?",
        context: "Findings mention environmental hazards.",
    },
    Heuristic {
        category: QuestionCategory::Legal,
        keywords: &["covenant", "easement", "title", "boundary", "planning", "lease", "consent"],
        question: "Which title or planning matters should my solicitor raise with the seller's solicitor?",
        context: "Findings mention legal or planning matters.",
    },
];

/// Fixed questions keyed off the severities and keywords present. Never empty.
pub fn fallback_questions(findings: &[Finding]) -> Vec<Question> {
    let mut questions = Vec::new();

    let serious: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.kind == FindingType::RedFlag || f.severity >= Severity::High)
        .collect();
    if !serious.is_empty() {
        questions.push(fallback_question(
            QuestionCategory::Legal,
            "Which of the serious issues must be resolved before exchange, and should they change the price or contract terms?",
            Priority::High,
            "Some findings are red flags or high severity.",
            &serious,
        ));
    }

    for heuristic in HEURISTICS {
        let related: Vec<&Finding> = findings
            .iter()
            .filter(|f| {
                let haystack = format!("{} {}", f.title, f.description).to_lowercase();
                heuristic.keywords.iter().any(|kw| haystack.contains(kw))
            })
            .collect();
        if related.is_empty() {
            continue;
        }
        let priority = if related.iter().any(|f| f.severity >= Severity::High) {
            Priority::High
        } else {
            Priority::Medium
        };
        questions.push(fallback_question(
            heuristic.category,
            heuristic.question,
            priority,
            heuristic.context,
            &related,
        ));
    }

    questions.push(fallback_question(
        QuestionCategory::Other,
        "Are any documents or replies to enquiries still outstanding from the seller?",
        Priority::Low,
        "Outstanding information is a common cause of delay.",
        &[],
    ));
    questions
}

fn fallback_question(
    category: QuestionCategory,
    text: &str,
    priority: Priority,
    context: &str,
    related: &[&Finding],
) -> Question {
    Question {
        id: new_id("question", text),
        category,
        question: text.to_string(),
        priority,
        context: context.to_string(),
        related_findings: related.iter().map(|f| f.id.clone()).collect(),
    }
}
