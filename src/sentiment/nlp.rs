// =============================================================================
// Keyword NLP Scorer — weighted-lexicon sentiment over short texts
// =============================================================================
//
// Per text: score = mean of matched keyword weights, clamped to [-1, 1];
// confidence = min(1, tokens/100) * 0.5 + |score| * 0.5. Batch results are
// independent and preserve input order.
//
// A context-adjusted variant applies additive momentum from the previous
// score and a multiplicative session weighting (market hours x1.1, off hours
// x0.9). Structured on-chain metrics are scored on the same [-1, 1] scale.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-text scoring result.
#[derive(Debug, Clone, Serialize)]
pub struct TextScore {
    /// [-1, 1]
    pub score: f64,
    /// [0, 1]
    pub confidence: f64,
    pub tokens_processed: usize,
}

/// Broad market condition used by the context-adjusted variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketCondition {
    Bullish,
    Bearish,
    Neutral,
}

/// Context for the adjusted scoring variant.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext {
    /// Previous cycle's score for the same stream, in [-1, 1].
    pub previous_score: f64,
    pub market_condition: MarketCondition,
    /// UTC hour, 0-23; drives the session weighting.
    pub hour_utc: u32,
}

/// Additive weight of the previous score in the context-adjusted variant.
const MOMENTUM_FACTOR: f64 = 0.2;
/// US/EU overlap session treated as market hours for weighting purposes.
const MARKET_HOURS_UTC: std::ops::Range<u32> = 13..21;

/// Structured on-chain metrics scored alongside text sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnChainMetrics {
    #[serde(default)]
    pub tx_count: f64,
    #[serde(default)]
    pub large_transfer_count: f64,
    #[serde(default)]
    pub exchange_inflow: f64,
    #[serde(default)]
    pub exchange_outflow: f64,
    #[serde(default)]
    pub mempool_size: f64,
    #[serde(default)]
    pub dormant_activations: f64,
}

/// Keyword-weighted sentiment scorer.
pub struct KeywordScorer {
    lexicon: HashMap<&'static str, f64>,
}

impl KeywordScorer {
    /// Build the scorer with the default crypto lexicon.
    pub fn new() -> Self {
        let mut lexicon = HashMap::new();

        // Bullish vocabulary.
        for (word, weight) in [
            ("moon", 0.8),
            ("bullish", 0.7),
            ("ath", 0.7),
            ("rally", 0.6),
            ("partnership", 0.6),
            ("breakout", 0.5),
            ("surge", 0.5),
            ("adoption", 0.5),
            ("listing", 0.5),
            ("upgrade", 0.4),
            ("accumulation", 0.4),
            ("pump", 0.3),
        ] {
            lexicon.insert(word, weight);
        }

        // Bearish vocabulary.
        for (word, weight) in [
            ("hack", -0.9),
            ("exploit", -0.9),
            ("breach", -0.9),
            ("rug", -0.8),
            ("scam", -0.8),
            ("crash", -0.8),
            ("bearish", -0.7),
            ("ban", -0.7),
            ("delisting", -0.7),
            ("lawsuit", -0.6),
            ("dump", -0.6),
            ("selloff", -0.6),
            ("liquidation", -0.5),
            ("fud", -0.4),
            ("regulation", -0.4),
            ("sec", -0.3),
        ] {
            lexicon.insert(word, weight);
        }

        Self { lexicon }
    }

    /// Score a single short text.
    pub fn score_text(&self, text: &str) -> TextScore {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let matched: Vec<f64> = tokens
            .iter()
            .filter_map(|t| self.lexicon.get(t.as_str()).copied())
            .collect();

        let score = if matched.is_empty() {
            0.0
        } else {
            (matched.iter().sum::<f64>() / matched.len() as f64).clamp(-1.0, 1.0)
        };

        let confidence = (tokens.len() as f64 / 100.0).min(1.0) * 0.5 + score.abs() * 0.5;

        TextScore {
            score,
            confidence,
            tokens_processed: tokens.len(),
        }
    }

    /// Score a batch of texts; results are independent and preserve order.
    pub fn score_batch<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> Vec<TextScore> {
        texts.into_iter().map(|t| self.score_text(t)).collect()
    }

    /// Context-adjusted variant: additive momentum from the previous score,
    /// then multiplicative session and condition weighting.
    pub fn score_text_with_context(&self, text: &str, ctx: &ScoringContext) -> TextScore {
        let base = self.score_text(text);

        let momentum = MOMENTUM_FACTOR * ctx.previous_score.clamp(-1.0, 1.0);
        let session_weight = if MARKET_HOURS_UTC.contains(&(ctx.hour_utc % 24)) {
            1.1
        } else {
            0.9
        };
        let condition_weight = match ctx.market_condition {
            MarketCondition::Bullish => 1.05,
            MarketCondition::Bearish => 0.95,
            MarketCondition::Neutral => 1.0,
        };

        let score = ((base.score + momentum) * session_weight * condition_weight).clamp(-1.0, 1.0);

        TextScore {
            score,
            confidence: base.confidence,
            tokens_processed: base.tokens_processed,
        }
    }

    /// Score structured on-chain metrics on the same [-1, 1] scale.
    ///
    /// Net exchange outflow reads as accumulation (bullish); heavy large
    /// transfers and dormant-wallet activations read as distribution risk.
    pub fn score_onchain(&self, metrics: &OnChainMetrics) -> TextScore {
        let flow_total = metrics.exchange_inflow + metrics.exchange_outflow;
        let flow_score = if flow_total > 0.0 {
            (metrics.exchange_outflow - metrics.exchange_inflow) / flow_total
        } else {
            0.0
        };

        // Normalised activity pressures in [0, 1].
        let transfer_pressure = (metrics.large_transfer_count / 100.0).min(1.0);
        let dormant_pressure = (metrics.dormant_activations / 50.0).min(1.0);
        let congestion = (metrics.mempool_size / 100_000.0).min(1.0);

        let score = (flow_score * 0.6
            - transfer_pressure * 0.2
            - dormant_pressure * 0.15
            - congestion * 0.05)
            .clamp(-1.0, 1.0);

        // Confidence tracks on-chain activity: more transactions, more signal.
        let activity = (metrics.tx_count / 10_000.0).min(1.0);
        let confidence = activity * 0.5 + score.abs() * 0.5;

        TextScore {
            score,
            confidence,
            tokens_processed: 0,
        }
    }
}

impl Default for KeywordScorer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullish_text_scores_positive() {
        let scorer = KeywordScorer::new();
        let result = scorer.score_text("BTC breakout incoming, very bullish rally");
        assert!(result.score > 0.0);
        assert!(result.confidence > 0.0);
        assert_eq!(result.tokens_processed, 6);
    }

    #[test]
    fn bearish_text_scores_negative() {
        let scorer = KeywordScorer::new();
        let result = scorer.score_text("protocol hack confirmed, massive dump and liquidation");
        assert!(result.score < -0.5);
    }

    #[test]
    fn no_keywords_is_neutral() {
        let scorer = KeywordScorer::new();
        let result = scorer.score_text("the quick brown fox");
        assert_eq!(result.score, 0.0);
        // Confidence from token count only: 4/100 * 0.5.
        assert!((result.confidence - 0.02).abs() < 1e-10);
    }

    #[test]
    fn empty_text() {
        let scorer = KeywordScorer::new();
        let result = scorer.score_text("");
        assert_eq!(result.score, 0.0);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.tokens_processed, 0);
    }

    #[test]
    fn score_always_in_range() {
        let scorer = KeywordScorer::new();
        for text in [
            "moon moon moon moon ath bullish rally surge pump",
            "hack exploit breach rug scam crash dump",
            "",
            "mixed bullish hack signals",
        ] {
            let r = scorer.score_text(text);
            assert!((-1.0..=1.0).contains(&r.score), "score {} for '{text}'", r.score);
            assert!((0.0..=1.0).contains(&r.confidence));
        }
    }

    #[test]
    fn batch_preserves_order() {
        let scorer = KeywordScorer::new();
        let texts = ["bullish rally", "hack exploit", "nothing here"];
        let results = scorer.score_batch(texts);
        assert_eq!(results.len(), 3);
        assert!(results[0].score > 0.0);
        assert!(results[1].score < 0.0);
        assert_eq!(results[2].score, 0.0);
    }

    #[test]
    fn context_momentum_and_session_weighting() {
        let scorer = KeywordScorer::new();
        let base = scorer.score_text("bullish rally");

        let market_hours = scorer.score_text_with_context(
            "bullish rally",
            &ScoringContext {
                previous_score: 0.5,
                market_condition: MarketCondition::Neutral,
                hour_utc: 15,
            },
        );
        let expected = ((base.score + 0.2 * 0.5) * 1.1).clamp(-1.0, 1.0);
        assert!((market_hours.score - expected).abs() < 1e-10);

        let off_hours = scorer.score_text_with_context(
            "bullish rally",
            &ScoringContext {
                previous_score: 0.5,
                market_condition: MarketCondition::Neutral,
                hour_utc: 3,
            },
        );
        assert!(off_hours.score < market_hours.score);
    }

    #[test]
    fn onchain_outflow_is_bullish() {
        let scorer = KeywordScorer::new();
        let bullish = scorer.score_onchain(&OnChainMetrics {
            tx_count: 8_000.0,
            exchange_inflow: 100.0,
            exchange_outflow: 900.0,
            ..Default::default()
        });
        assert!(bullish.score > 0.0);

        let bearish = scorer.score_onchain(&OnChainMetrics {
            tx_count: 8_000.0,
            exchange_inflow: 900.0,
            exchange_outflow: 100.0,
            large_transfer_count: 150.0,
            dormant_activations: 60.0,
            ..Default::default()
        });
        assert!(bearish.score < -0.5);
    }
}
