//! Confidence Scoring
//!
//! Heuristic estimate in [0, 1] of how well a generated document matches
//! the request: structural markers plus literal prompt-word coverage.

use crate::config::ScoringConfig;

pub struct ConfidenceScorer {
    config: ScoringConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, xml: &str, prompt: &str) -> f64 {
        let mut score = self.config.base;

        if xml.contains("<mxfile") && xml.contains("</mxfile>") {
            score += self.config.wrapper_bonus;
        }
        if xml.contains("<mxCell") {
            score += self.config.cell_bonus;
        }
        score += self.coverage(xml, prompt) * self.config.coverage_weight;

        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }

    /// Share of prompt words that are long enough to qualify and appear,
    /// case-insensitively, in the document text. Short words still count
    /// toward the total. Zero for an empty prompt.
    pub fn coverage(&self, xml: &str, prompt: &str) -> f64 {
        let haystack = xml.to_lowercase();
        let words: Vec<String> = prompt.split_whitespace().map(str::to_lowercase).collect();

        if words.is_empty() {
            return 0.0;
        }
        let covered = words
            .iter()
            .filter(|w| w.chars().count() >= self.config.min_word_length)
            .filter(|w| haystack.contains(w.as_str()))
            .count();
        covered as f64 / words.len() as f64
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/><mxCell id="2" value="Payment Service"/></root></mxGraphModel></diagram></mxfile>"#;

    #[test]
    fn test_full_marks_are_capped() {
        let score = ConfidenceScorer::default().score(DOC, "payment service");
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_base_only_for_plain_text() {
        assert_eq!(ConfidenceScorer::default().score("hello", "a b c"), 0.5);
    }

    #[test]
    fn test_wrapper_without_cells() {
        let score = ConfidenceScorer::default().score("<mxfile></mxfile>", "");
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_short_words_dilute_coverage() {
        let scorer = ConfidenceScorer::default();
        assert_eq!(scorer.coverage(DOC, "the api for payment"), 0.25);
        assert_eq!(scorer.coverage(DOC, "ORDER payment"), 0.5);
        assert_eq!(scorer.coverage(DOC, "a an of"), 0.0);
        assert_eq!(scorer.coverage(DOC, "   "), 0.0);
    }

    #[test]
    fn test_hostile_weights_stay_bounded() {
        let scorer = ConfidenceScorer::new(ScoringConfig {
            base: -3.0,
            wrapper_bonus: f64::NAN,
            ..ScoringConfig::default()
        });
        let score = scorer.score(DOC, "payment");
        assert!((0.0..=1.0).contains(&score));
    }
}
