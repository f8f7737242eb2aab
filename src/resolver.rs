use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::fuzzy::{extract_bests, full_process, ratio};
use crate::{ConfigError, dedup_keep_order, is_stopword};

/// Exact, properly-cased member name as stored in the index.
pub type CanonicalName = String;

const BUILTIN_MEMBERS: &[&str] = &[
    "Thiago Monteiro",
    "Armand Dupont",
    "Lily O'Sullivan",
    "Fatima El-Tahir",
    "Sophia Al-Farsi",
    "Layla Kawaguchi",
    "Amina Van Den Berg",
    "Lorenzo Cavalli",
    "Vikram Desai",
    "Hans Müller",
];

/// Ordered, immutable list of known member names.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    names: Vec<CanonicalName>,
}

impl EntityRegistry {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cleaned = names
            .into_iter()
            .map(Into::into)
            .map(|n: String| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            names: dedup_keep_order(cleaned),
        }
    }

    pub fn builtin() -> Self {
        Self::from_names(BUILTIN_MEMBERS.iter().copied())
    }

    /// Loads a registry from a JSON array of strings or a newline-separated text file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let trimmed = raw.trim_start();
        if trimmed.starts_with('[') {
            let names: Vec<String> = serde_json::from_str(trimmed)?;
            return Ok(Self::from_names(names));
        }
        Ok(Self::from_names(
            raw.lines().filter(|line| !line.trim_start().starts_with('#')),
        ))
    }

    pub fn names(&self) -> &[CanonicalName] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Named-entity spans and proper nouns found in a question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Multi-token person or organization spans, in question order.
    pub entities: Vec<String>,
    /// Single proper-noun tokens, in question order.
    pub proper_nouns: Vec<String>,
    /// Proper nouns that stood alone at the start of a sentence. Capitalization
    /// says nothing about them, so the resolver keeps one only when it is close
    /// to a registered first or last name.
    pub sentence_openers: Vec<String>,
}

pub trait EntityExtractor: Send + Sync {
    fn extract(&self, question: &str) -> Extraction;
}

/// Capitalization-based extractor.
///
/// A token is a proper noun when it starts with an uppercase letter and is not
/// a common function word. A lone capitalized sentence opener is reported in
/// [`Extraction::sentence_openers`] as well. Consecutive proper nouns (optionally joined by lowercase surname particles
/// such as `van` or `al`) form an entity span.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicExtractor;

#[derive(Debug)]
struct Word {
    text: String,
    sentence_start: bool,
}

fn split_words(question: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut sentence_start = true;
    for raw in question.split_whitespace() {
        let ends_sentence = raw.ends_with(['.', '?', '!']);
        let mut text = raw
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '’')
            .trim_matches(['\'', '’'])
            .to_string();
        for suffix in ["'s", "’s"] {
            if let Some(stripped) = text.strip_suffix(suffix) {
                text = stripped.to_string();
            }
        }
        if !text.is_empty() {
            words.push(Word {
                text,
                sentence_start,
            });
            sentence_start = false;
        }
        if ends_sentence {
            sentence_start = true;
        }
    }
    words
}

fn is_particle(word: &str) -> bool {
    matches!(
        word,
        "van" | "von" | "den" | "der" | "de" | "da" | "del" | "al" | "el" | "la" | "le" | "di"
    )
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn is_name_like(word: &str) -> bool {
    is_capitalized(word) && !is_stopword(&word.to_lowercase()) && !is_non_name(word)
}

fn is_non_name(word: &str) -> bool {
    matches!(
        word.to_lowercase().as_str(),
        "please" | "show" | "list" | "find" | "summarize" | "does" | "whose" | "whom" | "anyone"
            | "everyone" | "someone" | "user" | "users" | "member" | "members" | "message"
            | "messages" | "monday" | "tuesday" | "wednesday" | "thursday" | "friday"
            | "saturday" | "sunday"
    )
}

impl EntityExtractor for HeuristicExtractor {
    fn extract(&self, question: &str) -> Extraction {
        let words = split_words(question);
        let mut out = Extraction::default();

        let mut i = 0;
        while i < words.len() {
            if !is_name_like(&words[i].text) {
                i += 1;
                continue;
            }
            // Grow a run of name-like tokens, allowing lowercase particles between them.
            let mut run = vec![words[i].text.clone()];
            let mut j = i + 1;
            while j < words.len() && !words[j].sentence_start {
                if is_name_like(&words[j].text) {
                    run.push(words[j].text.clone());
                    j += 1;
                    continue;
                }
                let mut k = j;
                while k < words.len() && !words[k].sentence_start && is_particle(&words[k].text)
                {
                    k += 1;
                }
                let closes_on_name = k > j
                    && words
                        .get(k)
                        .is_some_and(|next| !next.sentence_start && is_name_like(&next.text));
                if !closes_on_name {
                    break;
                }
                run.extend(words[j..k].iter().map(|w| w.text.clone()));
                j = k;
            }

            let proper: Vec<&String> = run.iter().filter(|t| is_capitalized(t)).collect();
            if proper.len() >= 2 {
                out.entities.push(run.join(" "));
                out.proper_nouns.extend(proper.into_iter().cloned());
            } else {
                if words[i].sentence_start {
                    out.sentence_openers.push(run[0].clone());
                }
                out.proper_nouns.push(run[0].clone());
            }
            i = j;
        }

        out.entities = dedup_keep_order(out.entities);
        out.proper_nouns = dedup_keep_order(out.proper_nouns);
        out.sentence_openers = dedup_keep_order(out.sentence_openers);
        out
    }
}

/// Lowercased, punctuation-stripped content words of the question.
fn fallback_tokens(question: &str) -> Vec<String> {
    let tokens = split_words(question)
        .into_iter()
        .map(|w| w.text.to_lowercase())
        .filter(|t| !is_stopword(t))
        .collect();
    dedup_keep_order(tokens)
}

/// Maps a question to the registry members it mentions.
pub struct EntityResolver {
    registry: Arc<EntityRegistry>,
    extractor: Box<dyn EntityExtractor>,
    cutoff: u8,
    limit: usize,
}

impl EntityResolver {
    pub fn new(registry: Arc<EntityRegistry>, cutoff: u8, limit: usize) -> Self {
        Self::with_extractor(registry, Box::new(HeuristicExtractor), cutoff, limit)
    }

    pub fn with_extractor(
        registry: Arc<EntityRegistry>,
        extractor: Box<dyn EntityExtractor>,
        cutoff: u8,
        limit: usize,
    ) -> Self {
        Self {
            registry,
            extractor,
            cutoff,
            limit,
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Candidate strings in matching order: entity spans, proper nouns, and
    /// only when both are empty, the question's content words.
    pub fn candidates(&self, question: &str) -> Vec<String> {
        let extraction = self.extractor.extract(question);
        let mut candidates = extraction.entities;
        candidates.extend(extraction.proper_nouns.into_iter().filter(|noun| {
            !extraction.sentence_openers.contains(noun) || self.is_near_name_part(noun)
        }));
        let candidates = dedup_keep_order(candidates);
        if candidates.is_empty() {
            return fallback_tokens(question);
        }
        candidates
    }

    /// True when `word` is within the cutoff of some registered first or last name.
    fn is_near_name_part(&self, word: &str) -> bool {
        let word = full_process(word);
        self.registry.names().iter().any(|name| {
            full_process(name)
                .split_whitespace()
                .any(|part| ratio(&word, part) >= self.cutoff)
        })
    }

    /// Returns the registry members the question refers to, first match first.
    /// Every returned name is an exact registry entry.
    pub fn resolve(&self, question: &str) -> Vec<CanonicalName> {
        let mut matched = Vec::new();
        for candidate in self.candidates(question) {
            for (name, score) in
                extract_bests(&candidate, self.registry.names(), self.cutoff, self.limit)
            {
                debug!(candidate = %candidate, name, score, "registry match");
                matched.push(name.to_string());
            }
        }
        dedup_keep_order(matched)
    }
}
