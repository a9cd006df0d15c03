//! Quality scoring: initial composite, feedback updates and time decay.
//!
//! The composite is a weighted sum of six clamped sub-scores, held under a soft
//! ceiling. After creation the composite moves by feedback (diminishing-returns
//! blend) and by decay (loss of recency), each producing a new snapshot.

use chrono::{DateTime, Utc};

use super::types::{FeedbackOutcome, MemoryFragment, NewFragment, QualityScores, Scope, UsageStats};
use crate::config::QualityConfig;
use crate::memory::fingerprint::FIELD_COUNT;

const CONFIDENCE_WEIGHT: f64 = 0.25;
const VALIDATION_WEIGHT: f64 = 0.20;
const RECENCY_WEIGHT: f64 = 0.15;
const CONSENSUS_WEIGHT: f64 = 0.20;
const SPECIFICITY_WEIGHT: f64 = 0.10;
const IMPACT_WEIGHT: f64 = 0.10;

/// Validation count at which the validation sub-score saturates.
const VALIDATION_SATURATION: f64 = 10.0;
/// Context specificity credited to universally scoped fragments.
const UNIVERSAL_SPECIFICITY: f64 = 0.2;
/// Impact assumed before any application is reported.
const UNKNOWN_IMPACT: f64 = 0.5;

/// A computed quality change, ready to be written as a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityUpdate {
    pub quality_score: f64,
    pub quality: QualityScores,
    pub usage: UsageStats,
    pub last_validated_at: DateTime<Utc>,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    ceiling: f64,
    decay_rate: f64,
    decay_period_days: f64,
    default_confidence: f64,
}

impl QualityScorer {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            ceiling: config.ceiling.clamp(0.0, 1.0),
            decay_rate: config.decay_rate.max(0.0),
            decay_period_days: (config.decay_period_days.max(1)) as f64,
            default_confidence: config.default_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Weighted composite of clamped sub-scores, or `None` if any input is not finite.
    pub fn composite(&self, scores: &QualityScores) -> Option<f64> {
        if !scores.is_finite() {
            return None;
        }
        let c = |v: f64| v.clamp(0.0, 1.0);
        let sum = CONFIDENCE_WEIGHT * c(scores.confidence)
            + VALIDATION_WEIGHT * c(scores.validation)
            + RECENCY_WEIGHT * c(scores.recency)
            + CONSENSUS_WEIGHT * c(scores.consensus)
            + SPECIFICITY_WEIGHT * c(scores.context_specificity)
            + IMPACT_WEIGHT * c(scores.impact);
        Some(self.bound(sum))
    }

    /// Composite for a stored fragment; falls back to its last known-good score.
    pub fn compute(&self, fragment: &MemoryFragment) -> f64 {
        match self.composite(&fragment.quality) {
            Some(score) => score,
            None => {
                tracing::warn!(id = %fragment.id, "non-finite quality sub-scores, keeping last score");
                self.bound(fragment.quality_score)
            }
        }
    }

    /// Sub-scores and composite for a fresh submission.
    ///
    /// `reputations` holds one entry per distinct contributor.
    pub fn initial(&self, new: &NewFragment, reputations: &[f64]) -> (QualityScores, f64) {
        let scores = QualityScores {
            confidence: new.confidence.unwrap_or(self.default_confidence),
            validation: validation_subscore(0),
            recency: 1.0,
            consensus: consensus_subscore(reputations),
            context_specificity: match new.scope {
                Scope::Universal => UNIVERSAL_SPECIFICITY,
                _ => new.fingerprint.populated_fields() as f64 / FIELD_COUNT as f64,
            },
            impact: UNKNOWN_IMPACT,
        };

        let composite = match new.initial_quality {
            Some(seed) if seed.is_finite() => self.bound(seed),
            _ => self.composite(&scores).unwrap_or_else(|| {
                tracing::warn!(agent_type = %new.agent_type, "non-finite initial sub-scores, using default confidence");
                self.bound(self.default_confidence)
            }),
        };

        (scores, composite)
    }

    /// Blend a feedback outcome into the composite with diminishing weight.
    ///
    /// `weight = 1 / ln(validation_count + 2)`, capped at 1.
    pub fn update_on_feedback(
        &self,
        fragment: &MemoryFragment,
        outcome: FeedbackOutcome,
        now: DateTime<Utc>,
    ) -> QualityUpdate {
        let n = fragment.usage.validation_count;
        let weight = (1.0 / ((n as f64) + 2.0).ln()).min(1.0);
        let old = fragment.quality_score;
        let blended = old * (1.0 - weight) + outcome.value() * weight;
        let quality_score = if blended.is_finite() {
            self.bound(blended)
        } else {
            tracing::warn!(id = %fragment.id, "non-finite feedback blend, keeping last score");
            self.bound(old)
        };

        let apps = fragment.usage.application_count;
        let prior_rate = if fragment.usage.success_rate.is_finite() {
            fragment.usage.success_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let success_rate =
            (prior_rate * apps as f64 + outcome.success()) / (apps as f64 + 1.0);

        let usage = UsageStats {
            validation_count: n.saturating_add(1),
            application_count: apps.saturating_add(1),
            success_rate,
            last_used_at: Some(now),
        };

        let mut quality = fragment.quality;
        quality.validation = validation_subscore(usage.validation_count);
        quality.impact = success_rate;
        let last_validated_at = if outcome.is_positive() {
            quality.recency = 1.0;
            now
        } else {
            fragment.temporal.last_validated_at
        };

        QualityUpdate {
            quality_score,
            quality,
            usage,
            last_validated_at,
            reason: "feedback",
        }
    }

    /// Recency after `now - last_validated`: linear loss, floored at 0.
    pub fn recency_at(&self, last_validated: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days = ((now - last_validated).num_seconds() as f64 / 86_400.0).max(0.0);
        (1.0 - self.decay_rate * days / self.decay_period_days).clamp(0.0, 1.0)
    }

    /// Lower recency by age and take the weighted drop off the composite.
    ///
    /// Returns `None` when recency has not moved since the last pass.
    pub fn update_on_time_decay(
        &self,
        fragment: &MemoryFragment,
        now: DateTime<Utc>,
    ) -> Option<QualityUpdate> {
        let recency = self.recency_at(fragment.temporal.last_validated_at, now);
        let previous = if fragment.quality.recency.is_finite() {
            fragment.quality.recency
        } else {
            1.0
        };
        let drop = previous - recency;
        if drop <= f64::EPSILON {
            return None;
        }

        let decayed = fragment.quality_score - RECENCY_WEIGHT * drop;
        let quality_score = if decayed.is_finite() {
            self.bound(decayed)
        } else {
            tracing::warn!(id = %fragment.id, "non-finite decay result, keeping last score");
            self.bound(fragment.quality_score)
        };

        let mut quality = fragment.quality;
        quality.recency = recency;

        Some(QualityUpdate {
            quality_score,
            quality,
            usage: fragment.usage.clone(),
            last_validated_at: fragment.temporal.last_validated_at,
            reason: "decay",
        })
    }

    fn bound(&self, score: f64) -> f64 {
        if score.is_finite() {
            score.clamp(0.0, self.ceiling)
        } else {
            0.0
        }
    }
}

/// `ln(1 + n) / ln(11)`, saturating at ten validations.
pub fn validation_subscore(count: u32) -> f64 {
    ((1.0 + count as f64).ln() / (1.0 + VALIDATION_SATURATION).ln()).clamp(0.0, 1.0)
}

/// Mean contributor reputation discounted for small contributor sets.
pub fn consensus_subscore(reputations: &[f64]) -> f64 {
    if reputations.is_empty() {
        return 0.0;
    }
    let n = reputations.len() as f64;
    let mean = reputations.iter().sum::<f64>() / n;
    (mean * (1.0 - 0.5f64.powf(n))).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fingerprint::ContextFingerprint;
    use crate::memory::types::{now, FragmentContent, KnowledgeKind, TemporalMetadata};

    fn scorer() -> QualityScorer {
        QualityScorer::new(&QualityConfig::default())
    }

    fn fragment(score: f64) -> MemoryFragment {
        let t = now();
        MemoryFragment {
            id: "f1".into(),
            agent_type: "architect".into(),
            kind: KnowledgeKind::Procedural,
            content: FragmentContent::new("use result types", "explicit errors"),
            quality_score: score,
            quality: QualityScores {
                confidence: 0.5,
                validation: 0.0,
                recency: 1.0,
                consensus: 0.25,
                context_specificity: 0.2,
                impact: 0.5,
            },
            fingerprint: ContextFingerprint::default(),
            usage: UsageStats::default(),
            contributors: vec!["a1".into()],
            temporal: TemporalMetadata {
                created_at: t,
                last_validated_at: t,
                valid_from: t,
                valid_until: None,
                deprecated_at: None,
            },
            supersedes: vec![],
            superseded_by: None,
            replaces: None,
            conflicts: vec![],
            scope: Scope::Contextual,
            cross_type_refs: vec![],
            archived_at: None,
            version: 1,
        }
    }

    #[test]
    fn composite_of_perfect_scores_hits_ceiling() {
        let perfect = QualityScores {
            confidence: 1.0,
            validation: 1.0,
            recency: 1.0,
            consensus: 1.0,
            context_specificity: 1.0,
            impact: 1.0,
        };
        assert_eq!(scorer().composite(&perfect), Some(0.95));
    }

    #[test]
    fn composite_clamps_sub_scores() {
        let wild = QualityScores {
            confidence: 7.0,
            validation: -3.0,
            recency: 0.0,
            consensus: 0.0,
            context_specificity: 0.0,
            impact: 0.0,
        };
        assert!((scorer().composite(&wild).unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn non_finite_input_falls_back_to_last_score() {
        let mut f = fragment(0.6);
        f.quality.impact = f64::NAN;
        assert_eq!(scorer().compute(&f), 0.6);
    }

    #[test]
    fn initial_quality_seed_is_capped() {
        let new = NewFragment::new(
            "architect",
            "a1",
            KnowledgeKind::Declarative,
            FragmentContent::new("p", "r"),
        )
        .with_initial_quality(0.99);
        let (_, composite) = scorer().initial(&new, &[0.5]);
        assert_eq!(composite, 0.95);
    }

    #[test]
    fn initial_scores_reflect_fingerprint_and_scope() {
        let fp = ContextFingerprint::builder()
            .technologies(["python"])
            .categories(["api"])
            .build();
        let new = NewFragment::new("architect", "a1", KnowledgeKind::Procedural, FragmentContent::new("p", "r"))
            .with_fingerprint(fp);
        let (scores, composite) = scorer().initial(&new, &[0.5]);
        assert!((scores.context_specificity - 0.4).abs() < 1e-9);
        assert!((scores.consensus - 0.25).abs() < 1e-9);
        assert!(composite > 0.0 && composite <= 0.95);

        let universal = new.with_scope(Scope::Universal);
        let (scores, _) = scorer().initial(&universal, &[0.5]);
        assert_eq!(scores.context_specificity, UNIVERSAL_SPECIFICITY);
    }

    #[test]
    fn first_helpful_feedback_takes_full_weight_then_diminishes() {
        let s = scorer();
        let f = fragment(0.5);
        let first = s.update_on_feedback(&f, FeedbackOutcome::Helpful, now());
        assert_eq!(first.quality_score, 0.95);
        assert_eq!(first.usage.validation_count, 1);

        let mut seasoned = fragment(0.5);
        seasoned.usage.validation_count = 20;
        let later = s.update_on_feedback(&seasoned, FeedbackOutcome::Helpful, now());
        let weight = 1.0 / 22f64.ln();
        assert!((later.quality_score - (0.5 * (1.0 - weight) + weight)).abs() < 1e-9);
    }

    #[test]
    fn feedback_sequences_stay_in_bounds() {
        let s = scorer();
        let mut f = fragment(0.5);
        let outcomes = [
            FeedbackOutcome::Helpful,
            FeedbackOutcome::Harmful,
            FeedbackOutcome::Harmful,
            FeedbackOutcome::Helpful,
            FeedbackOutcome::PartiallyHelpful,
            FeedbackOutcome::NotHelpful,
        ];
        for outcome in outcomes.iter().cycle().take(60) {
            let update = s.update_on_feedback(&f, *outcome, now());
            assert!((0.0..=0.95).contains(&update.quality_score));
            f.quality_score = update.quality_score;
            f.quality = update.quality;
            f.usage = update.usage;
        }
        assert_eq!(f.usage.validation_count, 60);
    }

    #[test]
    fn negative_feedback_does_not_revalidate() {
        let s = scorer();
        let mut f = fragment(0.5);
        let earlier = f.temporal.last_validated_at - chrono::Duration::days(10);
        f.temporal.last_validated_at = earlier;
        let update = s.update_on_feedback(&f, FeedbackOutcome::NotHelpful, now());
        assert_eq!(update.last_validated_at, earlier);
        assert_eq!(update.usage.success_rate, 0.0);
    }

    #[test]
    fn time_decay_is_linear_and_idempotent() {
        let s = scorer();
        let mut f = fragment(0.8);
        let t = now();
        f.temporal.last_validated_at = t - chrono::Duration::days(300);

        let update = s.update_on_time_decay(&f, t).unwrap();
        // 1% per 30 days over 300 days
        assert!((update.quality.recency - 0.9).abs() < 1e-9);
        assert!((update.quality_score - (0.8 - 0.15 * 0.1)).abs() < 1e-9);

        f.quality = update.quality;
        f.quality_score = update.quality_score;
        assert!(s.update_on_time_decay(&f, t).is_none());
    }

    #[test]
    fn recency_is_floored_at_zero() {
        let s = scorer();
        let t = now();
        assert_eq!(s.recency_at(t - chrono::Duration::days(365 * 300), t), 0.0);
        assert_eq!(s.recency_at(t + chrono::Duration::days(1), t), 1.0);
    }

    #[test]
    fn consensus_grows_with_contributors() {
        assert_eq!(consensus_subscore(&[]), 0.0);
        assert!(consensus_subscore(&[0.8, 0.8]) > consensus_subscore(&[0.8]));
    }
}
