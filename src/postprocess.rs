//! Post-Processor (C9).
//!
//! A small fixed pipeline of steps run on every non-empty model
//! output, generalized from the teacher's `EventProcessor`/
//! `EventPipeline` dispatch (originally written for proxied HTTP
//! events) to a local `RawTranslation` value. Steps run in a fixed
//! order rather than a configurable chain, matching spec.md's "runs on
//! every non-empty model output, in order" wording, but the trait
//! boundary is kept so a downstream crate can insert an additional
//! step without touching the engine.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// One post-processing pass over a raw translation. `glossary` is
/// mutated in place by steps that learn new terms.
pub trait PostProcessStep: Send + Sync {
    fn apply(&self, raw: &str, original: &str, glossary: &mut HashMap<String, String>) -> String;
}

/// Collapses all whitespace runs to a single space when the original
/// cue had no newline — suppresses AI-introduced line wrapping on
/// short inputs.
pub struct SingleLineGuard;

impl PostProcessStep for SingleLineGuard {
    fn apply(&self, raw: &str, original: &str, _glossary: &mut HashMap<String, String>) -> String {
        if original.contains('\n') {
            return raw.to_string();
        }
        collapse_whitespace(raw)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Maximal runs of contiguous CJK ideographs. A run has no word
/// boundaries of its own, so candidate extraction has to look inside
/// it rather than treat the whole run as one candidate.
fn cjk_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[一-鿿]+").expect("static pattern is valid"))
}

/// Splits a run into glossary lookups: known terms (longest match
/// first, scanned left to right) are pulled out whole so an embedded
/// term like "东京" is found inside a longer run; whatever is left
/// over is chopped into 2-char chunks, the candidate-proper-noun
/// shape, to mint as new terms.
fn extract_candidates(run: &str, glossary: &HashMap<String, String>) -> Vec<String> {
    let chars: Vec<char> = run.chars().collect();
    let mut known_keys: Vec<&str> = glossary.keys().map(String::as_str).collect();
    known_keys.sort_by_key(|k| std::cmp::Reverse(k.chars().count()));

    let mut candidates = Vec::new();
    let mut pending_start = 0;
    let mut i = 0;
    while i < chars.len() {
        let remaining: String = chars[i..].iter().collect();
        let matched_key = known_keys.iter().find(|k| remaining.starts_with(*k));
        match matched_key {
            Some(key) => {
                flush_new_term_chunks(&chars[pending_start..i], &mut candidates);
                candidates.push(key.to_string());
                i += key.chars().count();
                pending_start = i;
            }
            None => i += 1,
        }
    }
    flush_new_term_chunks(&chars[pending_start..], &mut candidates);
    candidates
}

/// Chops a span of unmatched CJK chars into non-overlapping 2-char
/// candidates, dropping a trailing odd leftover char.
fn flush_new_term_chunks(span: &[char], candidates: &mut Vec<String>) {
    let mut j = 0;
    while j + 2 <= span.len() {
        candidates.push(span[j..j + 2].iter().collect());
        j += 2;
    }
}

/// First-occurrence-wins glossary unification: a candidate already in
/// the glossary is rewritten to its canonical form; a new candidate
/// becomes canonical for the rest of the file.
pub struct GlossaryUnification;

impl PostProcessStep for GlossaryUnification {
    fn apply(&self, raw: &str, _original: &str, glossary: &mut HashMap<String, String>) -> String {
        let re = cjk_run_regex();
        let runs: Vec<String> = re.find_iter(raw).map(|m| m.as_str().to_string()).collect();

        let mut result = raw.to_string();
        for run in runs {
            let candidates = extract_candidates(&run, glossary);
            for candidate in candidates {
                match glossary.get(&candidate) {
                    Some(canonical) if canonical != &candidate => {
                        result = result.replace(&candidate, canonical);
                    }
                    Some(_) => {}
                    None => {
                        glossary.insert(candidate.clone(), candidate);
                    }
                }
            }
        }
        result
    }
}

const CJK_PUNCTUATION: &[char] = &['。', '，', '、', '！', '？', '；', '：', '「', '」', '『', '』'];
const ASCII_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

/// Replaces a configured set of CJK/ASCII punctuation with spaces,
/// then collapses whitespace. Only runs when `preserve_punctuation`
/// is false (default true — most calls are a no-op pass-through).
pub struct PunctuationStripper {
    pub preserve_punctuation: bool,
}

impl PostProcessStep for PunctuationStripper {
    fn apply(&self, raw: &str, _original: &str, _glossary: &mut HashMap<String, String>) -> String {
        if self.preserve_punctuation {
            return raw.to_string();
        }
        let stripped: String = raw
            .chars()
            .map(|c| {
                if CJK_PUNCTUATION.contains(&c) || ASCII_PUNCTUATION.contains(&c) {
                    ' '
                } else {
                    c
                }
            })
            .collect();
        collapse_whitespace(&stripped)
    }
}

/// Fixed three-step pipeline, constructed per file from the engine's
/// options.
pub struct PostProcessPipeline {
    steps: Vec<Box<dyn PostProcessStep>>,
}

impl PostProcessPipeline {
    pub fn new(preserve_punctuation: bool) -> Self {
        Self {
            steps: vec![
                Box::new(SingleLineGuard),
                Box::new(GlossaryUnification),
                Box::new(PunctuationStripper { preserve_punctuation }),
            ],
        }
    }

    pub fn run(&self, raw: &str, original: &str, glossary: &mut HashMap<String, String>) -> String {
        if raw.trim().is_empty() {
            return raw.to_string();
        }
        let mut current = raw.to_string();
        for step in &self.steps {
            current = step.apply(&current, original, glossary);
        }
        current
    }
}
