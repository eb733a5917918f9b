// Weight Model
// Named contribution weights for the composite score. The budget is 1.0;
// changing one weight redistributes the leftover over the others.

use crate::models::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Total budget every weight set is normalized against.
pub const WEIGHT_BUDGET: f64 = 1.0;
/// Lowest value a single weight may take.
pub const WEIGHT_FLOOR: f64 = 0.0;
/// Slack allowed when comparing sums against the budget.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeightKey {
    HateScore,
    HateThreateningScore,
    ViolenceScore,
    SexualScore,
    SexualMinorsScore,
    AggressivenessScore,
    FlagHate,
    FlagHateThreatening,
    FlagViolence,
    FlagSexual,
}

impl WeightKey {
    pub const ALL: [WeightKey; 10] = [
        WeightKey::HateScore,
        WeightKey::HateThreateningScore,
        WeightKey::ViolenceScore,
        WeightKey::SexualScore,
        WeightKey::SexualMinorsScore,
        WeightKey::AggressivenessScore,
        WeightKey::FlagHate,
        WeightKey::FlagHateThreatening,
        WeightKey::FlagViolence,
        WeightKey::FlagSexual,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightKey::HateScore => "hate_score",
            WeightKey::HateThreateningScore => "hate/threatening_score",
            WeightKey::ViolenceScore => "violence_score",
            WeightKey::SexualScore => "sexual_score",
            WeightKey::SexualMinorsScore => "sexual/minors_score",
            WeightKey::AggressivenessScore => "aggressiveness_score",
            WeightKey::FlagHate => "flag_hate",
            WeightKey::FlagHateThreatening => "flag_hate/threatening",
            WeightKey::FlagViolence => "flag_violence",
            WeightKey::FlagSexual => "flag_sexual",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    fn default_value(&self) -> f64 {
        match self {
            WeightKey::HateScore => 0.06,
            WeightKey::HateThreateningScore => 0.04,
            WeightKey::ViolenceScore => 0.04,
            WeightKey::SexualScore => 0.02,
            WeightKey::SexualMinorsScore => 0.02,
            WeightKey::AggressivenessScore => 0.06,
            WeightKey::FlagHate => 0.28,
            WeightKey::FlagHateThreatening => 0.14,
            WeightKey::FlagViolence => 0.20,
            WeightKey::FlagSexual => 0.14,
        }
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownWeightKey(s.to_string()))
    }
}

/// One value per [`WeightKey`]. Persisted as a JSON object keyed by
/// [`WeightKey::as_str`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct WeightSet {
    values: [f64; WeightKey::COUNT],
}

impl Default for WeightSet {
    fn default() -> Self {
        let mut values = [0.0; WeightKey::COUNT];
        for key in WeightKey::ALL {
            values[key.index()] = key.default_value();
        }
        Self { values }
    }
}

impl WeightSet {
    pub fn zeros() -> Self {
        Self {
            values: [0.0; WeightKey::COUNT],
        }
    }

    /// Bulk assignment without redistribution. Used for loaded data and
    /// fixtures; the result may violate the budget and must pass
    /// [`WeightSet::validate`] before a run.
    pub fn with(mut self, key: WeightKey, value: f64) -> Self {
        self.values[key.index()] = value;
        self
    }

    pub fn get(&self, key: WeightKey) -> f64 {
        self.values[key.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (WeightKey, f64)> + '_ {
        WeightKey::ALL.into_iter().map(move |k| (k, self.get(k)))
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Unassigned budget. Negative only for externally loaded sets.
    pub fn remaining(&self) -> f64 {
        WEIGHT_BUDGET - self.total()
    }

    /// In-place form of [`redistribute`].
    pub fn set_weight(&mut self, key: WeightKey, value: f64) {
        *self = redistribute(self, key, value);
    }

    /// Gate checked before a batch may start.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (key, value) in self.iter() {
            if !value.is_finite() || value < WEIGHT_FLOOR {
                return Err(ValidationError::InvalidWeight {
                    key: key.as_str().to_string(),
                    value,
                });
            }
        }
        let remaining = self.remaining();
        if remaining < -WEIGHT_TOLERANCE {
            return Err(ValidationError::WeightBudgetExceeded {
                total: self.total(),
                excess: -remaining,
            });
        }
        Ok(())
    }

    /// Rescale so the weights sum to the budget. An all-zero set falls back
    /// to the defaults. Only applied on explicit request.
    pub fn normalized(&self) -> Self {
        let total = self.total();
        if !total.is_finite() || total <= 0.0 {
            return Self::default();
        }
        let mut values = self.values;
        for v in values.iter_mut() {
            *v = (*v / total * WEIGHT_BUDGET).max(WEIGHT_FLOOR);
        }
        Self { values }
    }
}

/// Set `key` to `new_value` and spread what is left of the budget over the
/// other keys, proportionally to their current values (equally when they are
/// all zero). Afterwards the set sums to the budget.
pub fn redistribute(current: &WeightSet, key: WeightKey, new_value: f64) -> WeightSet {
    let cap = WEIGHT_BUDGET - WEIGHT_FLOOR;
    let value = if new_value.is_nan() {
        WEIGHT_FLOOR
    } else {
        new_value.clamp(WEIGHT_FLOOR, cap)
    };
    let leftover = (WEIGHT_BUDGET - value).max(0.0);

    let others: Vec<WeightKey> = WeightKey::ALL.into_iter().filter(|k| *k != key).collect();
    let others_sum: f64 = others.iter().map(|k| current.get(*k).max(0.0)).sum();

    let mut next = current.clone();
    next.values[key.index()] = value;
    if others_sum <= 0.0 {
        let share = leftover / others.len() as f64;
        for k in &others {
            next.values[k.index()] = share;
        }
    } else {
        for k in &others {
            next.values[k.index()] = current.get(*k).max(0.0) / others_sum * leftover;
        }
    }
    next
}

impl From<Map<String, Value>> for WeightSet {
    fn from(map: Map<String, Value>) -> Self {
        let mut set = WeightSet::default();
        for (name, value) in map {
            let key = match name.parse::<WeightKey>() {
                Ok(k) => k,
                Err(_) => {
                    warn!("[WEIGHTS] ignoring unknown weight key {:?}", name);
                    continue;
                }
            };
            match value.as_f64() {
                Some(v) => set.values[key.index()] = v,
                None => warn!("[WEIGHTS] weight {} is not a number, keeping default", key),
            }
        }
        set
    }
}

impl From<WeightSet> for Map<String, Value> {
    fn from(set: WeightSet) -> Self {
        set.iter()
            .map(|(k, v)| (k.as_str().to_string(), Value::from(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_on_budget(set: &WeightSet) {
        assert!(
            (set.total() - WEIGHT_BUDGET).abs() < WEIGHT_TOLERANCE,
            "total was {}",
            set.total()
        );
    }

    #[test]
    fn test_defaults_sum_to_budget() {
        let set = WeightSet::default();
        assert_on_budget(&set);
        assert!(set.validate().is_ok());
        assert_eq!(set.get(WeightKey::FlagHate), 0.28);
    }

    #[test]
    fn test_redistribute_keeps_budget() {
        let mut set = WeightSet::default();
        for (i, key) in WeightKey::ALL.into_iter().enumerate() {
            set.set_weight(key, (i as f64 * 0.13) % 0.9);
            assert_on_budget(&set);
        }
        set.set_weight(WeightKey::AggressivenessScore, 0.5);
        assert!((set.get(WeightKey::AggressivenessScore) - 0.5).abs() < 1e-12);
        assert_on_budget(&set);
    }

    #[test]
    fn test_redistribute_is_proportional() {
        let set = WeightSet::zeros()
            .with(WeightKey::FlagHate, 0.3)
            .with(WeightKey::FlagSexual, 0.1)
            .with(WeightKey::HateScore, 0.6);
        let next = redistribute(&set, WeightKey::HateScore, 0.2);
        assert!((next.get(WeightKey::FlagHate) - 0.6).abs() < 1e-12);
        assert!((next.get(WeightKey::FlagSexual) - 0.2).abs() < 1e-12);
        assert_eq!(next.get(WeightKey::FlagViolence), 0.0);
        assert_on_budget(&next);
    }

    #[test]
    fn test_full_weight_zeroes_others() {
        let next = redistribute(&WeightSet::default(), WeightKey::FlagViolence, 1.0);
        assert_eq!(next.get(WeightKey::FlagViolence), 1.0);
        for (key, value) in next.iter() {
            if key != WeightKey::FlagViolence {
                assert_eq!(value, 0.0, "{} should be zero", key);
            }
        }
    }

    #[test]
    fn test_value_is_clamped() {
        let next = redistribute(&WeightSet::default(), WeightKey::FlagHate, 1.7);
        assert_eq!(next.get(WeightKey::FlagHate), 1.0);
        assert_on_budget(&next);

        let next = redistribute(&WeightSet::default(), WeightKey::FlagHate, -0.4);
        assert_eq!(next.get(WeightKey::FlagHate), 0.0);
        assert_on_budget(&next);
    }

    #[test]
    fn test_zero_others_split_equally() {
        let set = WeightSet::zeros().with(WeightKey::SexualScore, 1.0);
        let next = redistribute(&set, WeightKey::SexualScore, 0.0);
        let share = 1.0 / (WeightKey::COUNT - 1) as f64;
        assert_eq!(next.get(WeightKey::SexualScore), 0.0);
        for (key, value) in next.iter() {
            if key != WeightKey::SexualScore {
                assert!((value - share).abs() < 1e-12);
            }
        }
        assert_on_budget(&next);
    }

    #[test]
    fn test_redistribute_is_pure() {
        let set = WeightSet::default();
        let a = redistribute(&set, WeightKey::HateScore, 0.3);
        let b = redistribute(&set, WeightKey::HateScore, 0.3);
        assert_eq!(a, b);
        assert_eq!(set, WeightSet::default());
    }

    #[test]
    fn test_over_budget_blocks() {
        let set = WeightSet::default().with(WeightKey::FlagHate, 0.9);
        assert!(set.remaining() < 0.0);
        assert!(matches!(
            set.validate(),
            Err(ValidationError::WeightBudgetExceeded { .. })
        ));
        assert!(set.normalized().validate().is_ok());
        assert_on_budget(&set.normalized());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let set = WeightSet::zeros().with(WeightKey::FlagSexual, -0.1);
        assert!(matches!(set.validate(), Err(ValidationError::InvalidWeight { .. })));
    }

    #[test]
    fn test_under_budget_is_allowed() {
        let set = WeightSet::zeros().with(WeightKey::FlagHate, 0.5);
        assert!((set.remaining() - 0.5).abs() < 1e-12);
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_json_keys() {
        let json = serde_json::to_value(WeightSet::default()).unwrap();
        assert_eq!(json["hate/threatening_score"], 0.04);
        assert_eq!(json["flag_hate"], 0.28);

        let parsed: WeightSet =
            serde_json::from_str(r#"{"flag_hate": 0.5, "bogus": 1.0}"#).unwrap();
        assert_eq!(parsed.get(WeightKey::FlagHate), 0.5);
        assert_eq!(parsed.get(WeightKey::FlagSexual), 0.14);
    }

    #[test]
    fn test_parse_key() {
        assert_eq!("flag_violence".parse::<WeightKey>(), Ok(WeightKey::FlagViolence));
        assert!("flag_self-harm".parse::<WeightKey>().is_err());
    }
}
