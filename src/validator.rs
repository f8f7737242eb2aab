//! Evidence validation for synthesized answers.
//!
//! A model answer is released only when it carries an `Evidences:` section
//! whose every line occurs verbatim in the context the model was shown, and
//! any `Inferences:` lines are explicitly labelled `INFERRED:`. Anything else
//! is replaced by [`REFUSAL`].

use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

pub const REFUSAL: &str = "I do not have that information.";

static EVIDENCES_HEADER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(?:\n[ \t]*\n)?evidences:").ok());
static INFERENCES_HEADER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)inferences:").ok());
static ANSWER_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*answer\s*:\s*").ok());

const INFERRED_PREFIX: &str = "inferred:";

/// Parsed sections of a synthesizer response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredAnswer {
    pub answer: String,
    pub inferences: Vec<String>,
    pub evidences: Vec<String>,
}

/// Why a response was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no Evidences: header")]
    MissingEvidenceHeader,

    #[error("Evidences: section is empty")]
    EmptyEvidence,

    #[error("inference line without INFERRED: prefix: {0}")]
    UnlabeledInference(String),

    #[error("evidence line not found in context: {0}")]
    UnsupportedEvidence(String),
}

fn non_blank_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits a response into its sections and enforces the format rules.
/// Does not look at the context.
pub fn parse_structured_answer(raw: &str) -> Result<StructuredAnswer, Rejection> {
    let header = EVIDENCES_HEADER
        .as_ref()
        .and_then(|re| re.find(raw))
        .ok_or(Rejection::MissingEvidenceHeader)?;
    let pre_evidence = &raw[..header.start()];
    let evidence_text = &raw[header.end()..];

    let inferences_header = INFERENCES_HEADER.as_ref().and_then(|re| re.find(pre_evidence));
    let (answer_text, inferences) = match inferences_header {
        Some(found) => {
            let lines = non_blank_lines(&pre_evidence[found.end()..]);
            if let Some(bad) = lines
                .iter()
                .find(|line| !line.to_lowercase().starts_with(INFERRED_PREFIX))
            {
                return Err(Rejection::UnlabeledInference(bad.clone()));
            }
            (&pre_evidence[..found.start()], lines)
        }
        None => (pre_evidence, Vec::new()),
    };

    let evidences = non_blank_lines(evidence_text);
    if evidences.is_empty() {
        return Err(Rejection::EmptyEvidence);
    }

    let answer_text = answer_text.trim();
    let answer = match ANSWER_LABEL.as_ref() {
        Some(re) => re.replace(answer_text, "").trim().to_string(),
        None => answer_text.to_string(),
    };
    Ok(StructuredAnswer {
        answer,
        inferences,
        evidences,
    })
}

/// Checks a parsed answer's evidence lines against `context`.
pub fn check_grounding(parsed: &StructuredAnswer, context: &str) -> Result<(), Rejection> {
    match parsed.evidences.iter().find(|line| !context.contains(line.as_str())) {
        Some(missing) => Err(Rejection::UnsupportedEvidence(missing.clone())),
        None => Ok(()),
    }
}

/// Returns the trimmed response when it is well-formed and fully grounded in
/// `context`, otherwise [`REFUSAL`].
pub fn validate(raw_answer: &str, context: &str) -> String {
    let verdict =
        parse_structured_answer(raw_answer).and_then(|parsed| check_grounding(&parsed, context));
    match verdict {
        Ok(()) => raw_answer.trim().to_string(),
        Err(rejection) => {
            info!(reason = %rejection, "answer rejected");
            REFUSAL.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTEXT: &str = "- On 2024-03-01T09:00:00, user Vikram Desai sent a message: 'I always want an aisle seat'\n\
                           - On 2024-03-05T12:00:00, user Vikram Desai sent a message: 'Book the Lisbon flight'\n";

    const GOOD: &str = "Answer: Vikram prefers aisle seats.\n\n\
        Inferences:\n\
        INFERRED: He travels often.\n\n\
        Evidences:\n\
        - On 2024-03-01T09:00:00, user Vikram Desai sent a message: 'I always want an aisle seat'\n";

    #[test]
    fn grounded_answer_is_returned_trimmed() {
        let padded = format!("\n  {GOOD}  \n");
        assert_eq!(validate(&padded, CONTEXT), GOOD.trim());
    }

    #[test]
    fn single_character_change_is_refused() {
        let altered = GOOD.replace("aisle seat'", "aisle seaT'");
        assert_eq!(validate(&altered, CONTEXT), REFUSAL);
    }

    #[test]
    fn missing_header_is_refused() {
        assert_eq!(validate("Answer: aisle.", CONTEXT), REFUSAL);
        assert_eq!(
            parse_structured_answer("Answer: aisle."),
            Err(Rejection::MissingEvidenceHeader)
        );
    }

    #[test]
    fn empty_evidence_section_is_refused() {
        assert_eq!(
            parse_structured_answer("Answer: aisle.\nEvidences:\n   \n"),
            Err(Rejection::EmptyEvidence)
        );
    }

    #[test]
    fn unlabeled_inference_is_refused() {
        let raw = "Answer: aisle.\nInferences:\nHe travels often.\nEvidences:\n- x";
        assert_eq!(
            parse_structured_answer(raw),
            Err(Rejection::UnlabeledInference("He travels often.".into()))
        );
    }

    #[test]
    fn headers_are_case_insensitive() {
        let raw = "answer: aisle\nINFERENCES:\ninferred: maybe\nEVIDENCES:\nBook the Lisbon flight";
        let parsed = parse_structured_answer(raw).expect("parse");
        assert_eq!(parsed.answer, "aisle");
        assert_eq!(parsed.inferences, vec!["inferred: maybe"]);
        assert_eq!(parsed.evidences, vec!["Book the Lisbon flight"]);
        assert_eq!(validate(raw, CONTEXT), raw.trim());
    }

    #[test]
    fn one_unsupported_line_rejects_everything() {
        let raw = "Answer: aisle\nEvidences:\nI always want an aisle seat\nHe also likes window seats";
        assert_eq!(validate(raw, CONTEXT), REFUSAL);
    }

    #[test]
    fn answer_without_inferences_section() {
        let raw = "Vikram is flying to Lisbon.\n\nEvidences:\nBook the Lisbon flight";
        let parsed = parse_structured_answer(raw).expect("parse");
        assert_eq!(parsed.answer, "Vikram is flying to Lisbon.");
        assert!(parsed.inferences.is_empty());
    }
}
