// Composite Scoring
// Weighted linear combination of classifier scores/flags and the judge score.
// self-harm and violence/graphic are carried as raw columns only.

use crate::models::{AggressivenessJudgment, Category, ModerationResult, ScoredRow};

use super::weights::{WeightKey, WeightSet};

/// What a weight key multiplies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Term {
    CategoryScore(Category),
    CategoryFlag(Category),
    Aggressiveness,
}

/// Every contributing term of the composite, one per weight key.
pub const COMPOSITE_TERMS: [(WeightKey, Term); 10] = [
    (WeightKey::HateScore, Term::CategoryScore(Category::Hate)),
    (WeightKey::HateThreateningScore, Term::CategoryScore(Category::HateThreatening)),
    (WeightKey::ViolenceScore, Term::CategoryScore(Category::Violence)),
    (WeightKey::SexualScore, Term::CategoryScore(Category::Sexual)),
    (WeightKey::SexualMinorsScore, Term::CategoryScore(Category::SexualMinors)),
    (WeightKey::AggressivenessScore, Term::Aggressiveness),
    (WeightKey::FlagHate, Term::CategoryFlag(Category::Hate)),
    (WeightKey::FlagHateThreatening, Term::CategoryFlag(Category::HateThreatening)),
    (WeightKey::FlagViolence, Term::CategoryFlag(Category::Violence)),
    (WeightKey::FlagSexual, Term::CategoryFlag(Category::Sexual)),
];

fn term_value(term: Term, moderation: &ModerationResult, judgment: &AggressivenessJudgment) -> f64 {
    match term {
        Term::CategoryScore(c) => moderation.score(c),
        Term::CategoryFlag(c) => {
            if moderation.flag(c) {
                1.0
            } else {
                0.0
            }
        }
        // Unavailable judgments count as 0.
        Term::Aggressiveness => judgment.score.map(f64::from).unwrap_or(0.0),
    }
}

/// Composite score for one row. Pure and linear in `weights`.
pub fn composite_score(
    moderation: &ModerationResult,
    judgment: &AggressivenessJudgment,
    weights: &WeightSet,
) -> f64 {
    COMPOSITE_TERMS
        .iter()
        .map(|(key, term)| weights.get(*key) * term_value(*term, moderation, judgment))
        .sum()
}

/// Recompute the composite of every row, e.g. after the weights changed.
pub fn apply_composite(rows: &mut [ScoredRow], weights: &WeightSet) {
    for row in rows.iter_mut() {
        row.composite = composite_score(&row.moderation, &row.judgment, weights);
    }
}
