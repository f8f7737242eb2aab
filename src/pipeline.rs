//! The question-answering pipeline.
//!
//! `QaSystem` owns one of each component and runs
//! resolve → per-member retrieval → assembly → synthesis → validation.
//! Every outcome, including failures, is a plain answer string.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    AnswerSynthesizer, CanonicalName, EntityRegistry, EntityResolver, FilteredRetriever,
    GENERATION_FAILED, REFUSAL, RetrievalError, assemble, assemble_lines, build_prompt, validate,
};

pub const NOT_INITIALIZED: &str =
    "Error: RAG system is not initialized. Please run the ingest command first.";
pub const RETRIEVAL_FAILED: &str = "Error: Could not retrieve information from the database.";
pub const USER_NOT_FOUND: &str = "Error: No user name found in question.";

static STATS_QUESTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bhow\s+many\s+(users|members|people|clients|messages)\b|\b(list|all|every|which)\s+(the\s+)?(users|members|clients)\b|\bsystem\s+stat",
    )
    .ok()
});

/// True for questions about the data set as a whole rather than one member.
pub fn is_stats_question(question: &str) -> bool {
    STATS_QUESTION
        .as_ref()
        .is_some_and(|re| re.is_match(question))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub number_of_users: usize,
    pub number_of_messages: usize,
    pub users: Vec<String>,
}

impl SystemStats {
    pub fn collect(
        registry: &EntityRegistry,
        retriever: &FilteredRetriever,
    ) -> Result<Self, RetrievalError> {
        let number_of_messages = retriever.count()?;
        let users = registry.names().to_vec();
        Ok(Self {
            number_of_users: users.len(),
            number_of_messages,
            users,
        })
    }

    /// Context lines the stats answer is validated against.
    pub fn context_lines(&self) -> Vec<String> {
        vec![
            format!("Number of users: {}", self.number_of_users),
            format!("Number of messages: {}", self.number_of_messages),
            format!("Users: {}", self.users.join(", ")),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Entity,
    Stats,
    Unresolved,
    Unavailable,
}

/// An answer plus what produced it.
#[derive(Debug, Clone, Serialize)]
pub struct QaAnswer {
    pub answer: String,
    pub route: Route,
    pub entities: Vec<CanonicalName>,
    pub documents: usize,
}

impl QaAnswer {
    fn sentinel(answer: &str, route: Route, entities: Vec<CanonicalName>) -> Self {
        Self {
            answer: answer.to_string(),
            route,
            entities,
            documents: 0,
        }
    }
}

pub struct QaSystem {
    resolver: EntityResolver,
    retriever: FilteredRetriever,
    synthesizer: AnswerSynthesizer,
    entity_k: usize,
}

impl QaSystem {
    pub fn new(
        resolver: EntityResolver,
        retriever: FilteredRetriever,
        synthesizer: AnswerSynthesizer,
        entity_k: usize,
    ) -> Self {
        Self {
            resolver,
            retriever,
            synthesizer,
            entity_k,
        }
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn retriever(&self) -> &FilteredRetriever {
        &self.retriever
    }

    pub fn entity_k(&self) -> usize {
        self.entity_k
    }

    pub fn system_stats(&self) -> Result<SystemStats, RetrievalError> {
        SystemStats::collect(self.resolver.registry(), &self.retriever)
    }

    pub fn answer(&self, question: &str) -> String {
        self.answer_detailed(question).answer
    }

    pub fn answer_detailed(&self, question: &str) -> QaAnswer {
        if !self.retriever.is_initialized() {
            return QaAnswer::sentinel(NOT_INITIALIZED, Route::Unavailable, Vec::new());
        }

        let entities = self.resolver.resolve(question);
        if entities.is_empty() {
            if is_stats_question(question) {
                return self.answer_stats(question);
            }
            info!("no member resolved from question");
            return QaAnswer::sentinel(USER_NOT_FOUND, Route::Unresolved, entities);
        }
        info!(entities = ?entities, "resolved members");

        let results = match self.retriever.search_all(&entities, question, self.entity_k) {
            Ok(results) => results,
            Err(RetrievalError::Uninitialized) => {
                return QaAnswer::sentinel(NOT_INITIALIZED, Route::Unavailable, entities);
            }
            Err(err) => {
                warn!(error = %err, "retrieval failed");
                return QaAnswer::sentinel(RETRIEVAL_FAILED, Route::Entity, entities);
            }
        };

        let context = assemble(&results);
        let documents = results.total_documents();
        if context.is_empty() {
            return QaAnswer::sentinel(REFUSAL, Route::Entity, entities);
        }

        QaAnswer {
            answer: self.synthesize_validated(&context, question),
            route: Route::Entity,
            entities,
            documents,
        }
    }

    fn answer_stats(&self, question: &str) -> QaAnswer {
        let stats = match self.system_stats() {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "stats lookup failed");
                return QaAnswer::sentinel(RETRIEVAL_FAILED, Route::Stats, Vec::new());
            }
        };
        let lines = stats.context_lines();
        let context = assemble_lines(lines.iter().map(String::as_str));
        QaAnswer {
            answer: self.synthesize_validated(&context, question),
            route: Route::Stats,
            entities: Vec::new(),
            documents: lines.len(),
        }
    }

    fn synthesize_validated(&self, context: &str, question: &str) -> String {
        let raw = self.synthesizer.synthesize(&build_prompt(context, question));
        if raw == GENERATION_FAILED {
            return raw;
        }
        validate(&raw, context)
    }
}

/// Shared handle used by the agent tools and the HTTP server.
pub type SharedQa = Arc<QaSystem>;

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::testing::{FailingCompletion, ScriptedCompletion, SlowIndex, StaticIndex};
    use crate::{Completion, CompletionService};

    const THIAGO_1: &str =
        "On 2024-02-01T10:00:00, user Thiago Monteiro sent a message: 'Please book a table at Nobu'";
    const THIAGO_2: &str =
        "On 2024-02-03T10:00:00, user Thiago Monteiro sent a message: 'Change my flight to Friday'";
    const AMINA_1: &str =
        "On 2024-03-01T08:00:00, user Amina Van Den Berg sent a message: 'I need a vegan menu'";
    const VIKRAM_1: &str =
        "On 2024-03-02T08:00:00, user Vikram Desai sent a message: 'Aisle seat please'";

    fn index() -> StaticIndex {
        StaticIndex::from_rows(&[
            ("Thiago Monteiro", THIAGO_1),
            ("Amina Van Den Berg", AMINA_1),
            ("Thiago Monteiro", THIAGO_2),
            ("Vikram Desai", VIKRAM_1),
        ])
    }

    fn system(index: StaticIndex, service: Arc<dyn CompletionService>) -> QaSystem {
        QaSystem::new(
            EntityResolver::new(Arc::new(EntityRegistry::builtin()), 70, 5),
            FilteredRetriever::new(Arc::new(index)),
            AnswerSynthesizer::new(service, 0.2, 256, Duration::from_secs(2)),
            10,
        )
    }

    #[test]
    fn phone_question_without_phone_evidence_is_refused() {
        let invented = "Answer: Thiago's phone number is 555-0101.\n\nEvidences:\n\
            - On 2024-02-01T10:00:00, user Thiago Monteiro sent a message: 'My number is 555-0101'";
        for reply in [invented, "I do not have that information."] {
            let scripted = Arc::new(ScriptedCompletion::new(vec![Completion::text(reply)]));
            let qa = system(index(), scripted);
            assert_eq!(
                qa.answer("What is the phone number for Thiago Monteiro?"),
                "I do not have that information."
            );
        }
    }

    #[test]
    fn misspelled_member_is_resolved_and_only_their_lines_are_shown() {
        let reply = format!("Answer: Amina wants a vegan menu.\n\nEvidences:\n- {AMINA_1}\n");
        let scripted = Arc::new(ScriptedCompletion::new(vec![Completion::text(reply.clone())]));
        let qa = system(index(), scripted.clone());

        let answer = qa.answer_detailed("What food does Amona prefer?");
        assert_eq!(answer.entities, vec!["Amina Van Den Berg"]);
        assert_eq!(answer.route, Route::Entity);
        assert_eq!(answer.documents, 1);
        assert_eq!(answer.answer, reply.trim());

        let prompt = scripted.requests()[0].messages[0].content_str().to_string();
        assert!(prompt.contains(&format!("- {AMINA_1}\n")));
        assert!(!prompt.contains("Thiago"));
    }

    #[test]
    fn context_follows_resolver_order() {
        let reply = format!("Answer: ok\nEvidences:\n{VIKRAM_1}\n{THIAGO_2}");
        let scripted = Arc::new(ScriptedCompletion::new(vec![Completion::text(reply)]));
        let qa = system(index(), scripted.clone());
        let answer = qa.answer_detailed("Compare Vikram Desai and Thiago Monteiro");
        assert_eq!(answer.entities, vec!["Vikram Desai", "Thiago Monteiro"]);
        let prompt = scripted.requests()[0].messages[0].content_str().to_string();
        let vikram = prompt.find(VIKRAM_1).expect("vikram line");
        let thiago = prompt.find(THIAGO_1).expect("thiago line");
        assert!(vikram < thiago);
        assert!(answer.answer.starts_with("Answer: ok"));
    }

    #[test]
    fn unresolved_question_never_calls_the_model() {
        let scripted = Arc::new(ScriptedCompletion::new(Vec::new()));
        let qa = system(index(), scripted.clone());
        assert_eq!(qa.answer("What is the weather like?"), USER_NOT_FOUND);
        assert_eq!(scripted.calls(), 0);
    }

    #[test]
    fn stats_question_is_answered_from_validated_stats() {
        let reply = "Answer: There are 10 users.\n\nEvidences:\nNumber of users: 10";
        let scripted = Arc::new(ScriptedCompletion::new(vec![Completion::text(reply)]));
        let qa = system(index(), scripted);
        let answer = qa.answer_detailed("How many users are there?");
        assert_eq!(answer.route, Route::Stats);
        assert_eq!(answer.answer, reply);

        let stats = qa.system_stats().expect("stats");
        assert_eq!(stats.number_of_messages, 4);
        assert_eq!(stats.number_of_users, 10);
    }

    #[test]
    fn disabled_retriever_reports_not_initialized() {
        let qa = QaSystem::new(
            EntityResolver::new(Arc::new(EntityRegistry::builtin()), 70, 5),
            FilteredRetriever::disabled(),
            AnswerSynthesizer::new(Arc::new(FailingCompletion), 0.2, 16, Duration::from_secs(1)),
            10,
        );
        assert_eq!(qa.answer("Where is Thiago Monteiro?"), NOT_INITIALIZED);
    }

    #[test]
    fn index_failure_reports_retrieval_failed() {
        let qa = system(StaticIndex::broken(), Arc::new(FailingCompletion));
        assert_eq!(qa.answer("Where is Thiago Monteiro?"), RETRIEVAL_FAILED);
        assert_eq!(qa.answer("How many messages are there?"), RETRIEVAL_FAILED);
    }

    #[test]
    fn slow_index_reports_retrieval_failed_within_the_search_timeout() {
        let qa = QaSystem::new(
            EntityResolver::new(Arc::new(EntityRegistry::builtin()), 70, 5),
            FilteredRetriever::new(Arc::new(SlowIndex::new(Duration::from_secs(3))))
                .with_timeout(Duration::from_millis(100)),
            AnswerSynthesizer::new(Arc::new(FailingCompletion), 0.2, 16, Duration::from_secs(1)),
            10,
        );
        let started = Instant::now();
        assert_eq!(qa.answer("Where is Thiago Monteiro?"), RETRIEVAL_FAILED);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn provider_failure_reports_generation_failed() {
        let qa = system(index(), Arc::new(FailingCompletion));
        assert_eq!(qa.answer("Where is Thiago Monteiro?"), GENERATION_FAILED);
    }

    #[test]
    fn stats_question_detection() {
        assert!(is_stats_question("How many users are there?"));
        assert!(is_stats_question("how many messages in total"));
        assert!(is_stats_question("List all members"));
        assert!(!is_stats_question("What is Vikram's seat preference?"));
    }
}
