use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::{CompletionRequest, CompletionService, complete_with_deadline};

pub const GENERATION_FAILED: &str = "Error: Could not generate an answer.";

const PROMPT_TEMPLATE: &str = "\
You are a professional assistant answering questions about members of a concierge service.
Answer the question using ONLY the context below. The context is a list of messages, one per line, each starting with \"- \".
Do not use any information you were not given. If the context does not contain the answer, reply exactly:
I do not have that information.

Respond in exactly this format:

Answer: <one or two sentences>

Inferences:
INFERRED: <a conclusion that is implied but not stated by the context>

Evidences:
<a context line copied character for character, one per line>

Rules:
- The Inferences section is optional; when present, every line in it must start with INFERRED:.
- The Evidences section is mandatory and must not be empty.
- Every evidence line must be copied verbatim from the context. Do not paraphrase, shorten, or fix typos.

CONTEXT:
{context}
QUESTION:
{question}
";

/// Fills the answer prompt with the assembled context and the question.
pub fn build_prompt(context: &str, question: &str) -> String {
    PROMPT_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

pub struct AnswerSynthesizer {
    service: Arc<dyn CompletionService>,
    temperature: f64,
    max_tokens: u64,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(
        service: Arc<dyn CompletionService>,
        temperature: f64,
        max_tokens: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            temperature,
            max_tokens,
            timeout,
        }
    }

    /// Returns the model's text, or [`GENERATION_FAILED`] on any provider
    /// error, timeout, or empty reply.
    pub fn synthesize(&self, prompt: &str) -> String {
        let request = CompletionRequest::prompt(prompt, self.temperature, self.max_tokens);
        match complete_with_deadline(&self.service, request, self.timeout) {
            Ok(completion) => match completion.content {
                Some(text) if !text.trim().is_empty() => {
                    debug!(chars = text.len(), "synthesized answer");
                    text
                }
                _ => {
                    error!("completion returned no text");
                    GENERATION_FAILED.to_string()
                }
            },
            Err(err) => {
                error!(error = %err, "answer synthesis failed");
                GENERATION_FAILED.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Completion;
    use crate::testing::{FailingCompletion, ScriptedCompletion, SlowCompletion};

    fn synth(service: Arc<dyn CompletionService>) -> AnswerSynthesizer {
        AnswerSynthesizer::new(service, 0.2, 256, Duration::from_millis(200))
    }

    #[test]
    fn prompt_embeds_context_and_question_verbatim() {
        let prompt = build_prompt("- line one\n- line two\n", "Where is Hans?");
        assert!(prompt.contains("CONTEXT:\n- line one\n- line two\n"));
        assert!(prompt.contains("QUESTION:\nWhere is Hans?"));
        assert!(prompt.contains("Evidences:"));
        assert!(prompt.contains("INFERRED:"));
    }

    #[test]
    fn returns_model_text_and_uses_configured_sampling() {
        let scripted = Arc::new(ScriptedCompletion::new(vec![Completion::text("Answer: x")]));
        let out = synth(scripted.clone()).synthesize("prompt");
        assert_eq!(out, "Answer: x");
        let requests = scripted.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].temperature, 0.2);
        assert!(requests[0].tools.is_empty());
    }

    #[test]
    fn provider_failure_becomes_sentinel() {
        assert_eq!(synth(Arc::new(FailingCompletion)).synthesize("p"), GENERATION_FAILED);
    }

    #[test]
    fn timeout_becomes_sentinel() {
        let slow = Arc::new(SlowCompletion::new(Duration::from_secs(2)));
        assert_eq!(synth(slow).synthesize("p"), GENERATION_FAILED);
    }

    #[test]
    fn empty_reply_becomes_sentinel() {
        let scripted = Arc::new(ScriptedCompletion::new(vec![Completion::text("   ")]));
        assert_eq!(synth(scripted).synthesize("p"), GENERATION_FAILED);
    }
}
