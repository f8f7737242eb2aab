//! Approximate string similarity on a 0–100 scale.
//!
//! The scorers mirror the classic "ratio" family: a plain edit-based ratio,
//! a best-window partial ratio, token-sorted and token-set variants, and a
//! weighted combination (`weighted_ratio`) that picks whichever view of the
//! two strings scores best, discounting the partial and token views so that
//! a full match always wins over a partial one.

use std::collections::BTreeSet;

const UNBASE_SCALE: f64 = 0.95;

/// Lowercases, replaces every non-alphanumeric character with a space and trims.
pub fn full_process(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Similarity in `[0, 1]`: `(|a| + |b| - indel_distance) / (|a| + |b|)`.
fn raw_ratio(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    (2 * lcs_len(a, b)) as f64 / total as f64
}

fn to_score(value: f64) -> u8 {
    (value.clamp(0.0, 100.0)).round() as u8
}

pub fn ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    to_score(100.0 * raw_ratio(&a, &b))
}

/// Best ratio of the shorter string against every equally long window of the longer one.
pub fn partial_ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    let width = shorter.len();
    let mut best = 0.0_f64;
    for start in 0..=(longer.len() - width) {
        let score = raw_ratio(&shorter, &longer[start..start + width]);
        if score > 0.995 {
            return 100;
        }
        best = best.max(score);
    }
    to_score(100.0 * best)
}

fn sorted_tokens(text: &str) -> String {
    let processed = full_process(text);
    let mut tokens: Vec<&str> = processed.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn token_sort(a: &str, b: &str, partial: bool) -> u8 {
    let a = sorted_tokens(a);
    let b = sorted_tokens(b);
    if partial {
        partial_ratio(&a, &b)
    } else {
        ratio(&a, &b)
    }
}

fn token_set(a: &str, b: &str, partial: bool) -> u8 {
    let pa = full_process(a);
    let pb = full_process(b);
    if pa.is_empty() || pb.is_empty() {
        return 0;
    }
    let ta: BTreeSet<&str> = pa.split_whitespace().collect();
    let tb: BTreeSet<&str> = pb.split_whitespace().collect();

    let join = |items: Vec<&str>| items.join(" ");
    let intersection = join(ta.intersection(&tb).copied().collect());
    let diff_ab = join(ta.difference(&tb).copied().collect());
    let diff_ba = join(tb.difference(&ta).copied().collect());

    let combined_ab = format!("{intersection} {diff_ab}").trim().to_string();
    let combined_ba = format!("{intersection} {diff_ba}").trim().to_string();

    let score = |x: &str, y: &str| if partial { partial_ratio(x, y) } else { ratio(x, y) };
    [
        score(&intersection, &combined_ab),
        score(&intersection, &combined_ba),
        score(&combined_ab, &combined_ba),
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
}

pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    token_sort(a, b, false)
}

pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    token_set(a, b, false)
}

/// Weighted best-of score used for registry matching.
pub fn weighted_ratio(a: &str, b: &str) -> u8 {
    let pa = full_process(a);
    let pb = full_process(b);
    if pa.is_empty() || pb.is_empty() {
        return 0;
    }

    let base = ratio(&pa, &pb) as f64;
    let la = pa.chars().count() as f64;
    let lb = pb.chars().count() as f64;
    let len_ratio = la.max(lb) / la.min(lb);

    if len_ratio < 1.5 {
        let sort = token_sort(&pa, &pb, false) as f64 * UNBASE_SCALE;
        let set = token_set(&pa, &pb, false) as f64 * UNBASE_SCALE;
        return to_score(base.max(sort).max(set));
    }

    let partial_scale = if len_ratio > 8.0 { 0.6 } else { 0.9 };
    let partial = partial_ratio(&pa, &pb) as f64 * partial_scale;
    let sort = token_sort(&pa, &pb, true) as f64 * UNBASE_SCALE * partial_scale;
    let set = token_set(&pa, &pb, true) as f64 * UNBASE_SCALE * partial_scale;
    to_score(base.max(partial).max(sort).max(set))
}

/// Scores `query` against every choice and returns up to `limit` matches at or
/// above `cutoff`, best first. Ties keep the order of `choices`.
pub fn extract_bests<'a>(
    query: &str,
    choices: &'a [String],
    cutoff: u8,
    limit: usize,
) -> Vec<(&'a str, u8)> {
    if full_process(query).is_empty() || limit == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &'a str, u8)> = choices
        .iter()
        .enumerate()
        .map(|(idx, choice)| (idx, choice.as_str(), weighted_ratio(query, choice)))
        .filter(|(_, _, score)| *score >= cutoff)
        .collect();
    scored.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, choice, score)| (choice, score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Vec<String> {
        crate::EntityRegistry::builtin().names().to_vec()
    }

    #[test]
    fn ratio_identical_and_disjoint() {
        assert_eq!(ratio("vikram", "vikram"), 100);
        assert_eq!(ratio("abc", "xyz"), 0);
        assert_eq!(ratio("", "abc"), 0);
    }

    #[test]
    fn partial_ratio_finds_embedded_substring() {
        assert_eq!(partial_ratio("thiago", "thiago monteiro"), 100);
        assert!(partial_ratio("vikrem", "vikram desai") >= 80);
    }

    #[test]
    fn token_sort_ignores_word_order() {
        assert_eq!(token_sort_ratio("Monteiro Thiago", "Thiago Monteiro"), 100);
    }

    #[test]
    fn token_set_handles_subset() {
        assert_eq!(token_set_ratio("Vikram", "Vikram Desai"), 100);
    }

    #[test]
    fn full_process_normalizes_punctuation() {
        assert_eq!(full_process("  Lily O'Sullivan! "), "lily o sullivan");
        assert_eq!(full_process("Hans Müller"), "hans müller");
    }

    #[test]
    fn typo_first_names_clear_the_cutoff() {
        assert!(weighted_ratio("Vikrem", "Vikram Desai") >= 70);
        assert!(weighted_ratio("Amona", "Amina Van Den Berg") >= 70);
    }

    #[test]
    fn unrelated_words_stay_below_cutoff() {
        for word in ["users", "many", "preference", "seat"] {
            for name in registry() {
                assert!(
                    weighted_ratio(word, &name) < 70,
                    "{word} unexpectedly matched {name}"
                );
            }
        }
    }

    #[test]
    fn extract_bests_orders_and_limits() {
        let choices = registry();
        let hits = extract_bests("Vikrem", &choices, 70, 5);
        assert_eq!(hits.first().map(|(name, _)| *name), Some("Vikram Desai"));

        let none = extract_bests("???", &choices, 70, 5);
        assert!(none.is_empty());

        let capped = extract_bests("Vikram Desai", &choices, 0, 2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].0, "Vikram Desai");
    }
}
