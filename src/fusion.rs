// =============================================================================
// Signal Fusion — technical signal x aggregated sentiment
// =============================================================================
//
// Pairs each technical signal with the latest sentiment for its symbol (no
// older than the staleness window) and produces the final action:
//
//   - HACK-class critical event           -> SKIP, regardless of side
//   - sentiment confidence below the gate -> technical signal passes as-is
//   - sentiment conflicts with the side   -> SKIP at confidence zero
//   - otherwise                           -> confidence boost, capped
//
// The boost scales linearly with |score| * confidence, capped at the
// configured maximum; the fused confidence never exceeds 0.95.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sentiment::{SentimentCache, SentimentSource};
use crate::strategies::TechnicalSignal;
use crate::types::{Action, CriticalEvent, EventKind, FinalAction};

/// Hard ceiling on any fused confidence.
const CONFIDENCE_CEILING: f64 = 0.95;

/// Final action after fusing a technical signal with aggregated sentiment.
/// Immutable once emitted; the execution fields are filled in exactly once by
/// the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedSignal {
    pub id: String,
    pub technical: TechnicalSignal,
    pub sentiment_score: f64,
    pub sentiment_confidence: f64,
    pub conflict: bool,
    pub final_action: FinalAction,
    pub final_confidence: f64,
    pub confidence_boost: f64,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_event: Option<CriticalEvent>,
    /// Per-source sentiment scores at signal time; carried onto any position
    /// opened from this signal for later weight attribution.
    pub source_scores: HashMap<SentimentSource, f64>,
    pub signal_time: DateTime<Utc>,

    // --- Execution outcome (lifecycle manager) --------------------------------
    pub was_executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

/// Fusion configuration, lifted from the engine config at startup.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub sentiment_staleness: Duration,
    pub min_sentiment_confidence: f64,
    pub conflict_threshold: f64,
    pub max_sentiment_boost: f64,
}

/// The fusion component: stateless aside from its view of the sentiment cache.
pub struct SignalFusion {
    cache: Arc<SentimentCache>,
    config: FusionConfig,
}

impl SignalFusion {
    pub fn new(cache: Arc<SentimentCache>, config: FusionConfig) -> Self {
        Self { cache, config }
    }

    /// Fuse one technical signal with the latest usable sentiment.
    pub fn fuse(&self, technical: TechnicalSignal) -> EnhancedSignal {
        let sentiment = self
            .cache
            .latest(&technical.symbol, self.config.sentiment_staleness);

        let base_action = match technical.action {
            Action::Buy => FinalAction::Buy,
            Action::Sell => FinalAction::Sell,
            Action::Hold => FinalAction::Hold,
        };

        let Some(sentiment) = sentiment else {
            return self.build(
                technical,
                0.0,
                0.0,
                false,
                base_action,
                |tech_conf| (tech_conf, 0.0),
                "no fresh sentiment; technical signal passes unchanged".to_string(),
                None,
                HashMap::new(),
            );
        };

        let source_scores: HashMap<SentimentSource, f64> = sentiment
            .per_source
            .iter()
            .map(|(source, reading)| (*source, reading.score))
            .collect();
        let score = sentiment.overall_score;
        let confidence = sentiment.overall_confidence;

        // --- Critical pre-empt: a HACK-class event forces SKIP ----------------
        let hack = sentiment
            .critical_events
            .iter()
            .find(|e| e.kind == EventKind::Hack)
            .cloned();
        if let Some(event) = hack {
            if technical.action != Action::Hold {
                let rationale = format!(
                    "pre-empted by {} event: {}",
                    event.kind, event.description
                );
                return self.build(
                    technical,
                    score,
                    confidence,
                    false,
                    FinalAction::Skip,
                    |_| (0.0, 0.0),
                    rationale,
                    Some(event),
                    source_scores,
                );
            }
        }

        // --- Low-confidence sentiment is ignored ------------------------------
        if confidence < self.config.min_sentiment_confidence {
            let rationale = format!(
                "sentiment confidence {confidence:.2} below {:.2}; sentiment ignored",
                self.config.min_sentiment_confidence
            );
            return self.build(
                technical,
                score,
                confidence,
                false,
                base_action,
                |tech_conf| (tech_conf, 0.0),
                rationale,
                None,
                source_scores,
            );
        }

        // --- Conflict: opposing sentiment of sufficient magnitude -------------
        let opposes = match technical.action {
            Action::Buy => score < 0.0,
            Action::Sell => score > 0.0,
            Action::Hold => false,
        };
        if opposes && score.abs() >= self.config.conflict_threshold {
            let rationale = format!(
                "sentiment {score:.2} conflicts with {} signal; skipped",
                technical.action
            );
            return self.build(
                technical,
                score,
                confidence,
                true,
                FinalAction::Skip,
                |_| (0.0, 0.0),
                rationale,
                None,
                source_scores,
            );
        }

        // --- Aligned or neutral: boost, linear in |score| * confidence --------
        let boost = (score.abs() * confidence).min(self.config.max_sentiment_boost);
        let rationale = format!(
            "sentiment {score:.2} @ {confidence:.2} boosts confidence by {:.1}%",
            boost * 100.0
        );
        self.build(
            technical,
            score,
            confidence,
            false,
            base_action,
            |tech_conf| ((tech_conf * (1.0 + boost)).min(CONFIDENCE_CEILING), boost),
            rationale,
            None,
            source_scores,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        technical: TechnicalSignal,
        sentiment_score: f64,
        sentiment_confidence: f64,
        conflict: bool,
        final_action: FinalAction,
        confidence_fn: impl FnOnce(f64) -> (f64, f64),
        rationale: String,
        critical_event: Option<CriticalEvent>,
        source_scores: HashMap<SentimentSource, f64>,
    ) -> EnhancedSignal {
        let (final_confidence, confidence_boost) = confidence_fn(technical.confidence);
        let signal_time = technical.ts;

        debug!(
            strategy_id = %technical.strategy_id,
            symbol = %technical.symbol,
            technical_action = %technical.action,
            final_action = %final_action,
            final_confidence,
            conflict,
            "signal fused"
        );

        EnhancedSignal {
            id: uuid::Uuid::new_v4().to_string(),
            technical,
            sentiment_score,
            sentiment_confidence,
            conflict,
            final_action,
            final_confidence,
            confidence_boost,
            rationale,
            critical_event,
            source_scores,
            signal_time,
            was_executed: false,
            execute_reason: None,
            execution_time: None,
            trade_id: None,
        }
    }
}
