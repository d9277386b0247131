use crate::catalog::SignalCombination;
use crate::models::{SignalAction, SignalObservation};
use crate::signals::{determine_signal_action, SignalType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const NEUTRAL_INCREMENT: f64 = 0.1;

/// Composite score for one day with the contributions that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComboScore {
    pub score: f64,
    pub buy_score: f64,
    pub sell_score: f64,
    pub neutral_score: f64,
    pub signal_count: usize,
    pub buy_signals: usize,
    pub sell_signals: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComboResult {
    pub combo_id: Option<i64>,
    pub combo_name: String,
    pub stock_code: String,
    pub date: NaiveDate,
    pub score: f64,
    pub signal_count: i32,
    pub buy_signals: i32,
    pub sell_signals: i32,
    pub description: String,
}

pub struct ComboScorer;

impl ComboScorer {
    pub fn score(combo: &SignalCombination, observations: &[SignalObservation]) -> f64 {
        Self::breakdown(combo, observations).score
    }

    pub fn breakdown(combo: &SignalCombination, observations: &[SignalObservation]) -> ComboScore {
        if observations.is_empty() {
            return ComboScore::default();
        }

        let weights: HashMap<SignalType, f64> = combo
            .enabled_members()
            .map(|member| (member.signal_type, member.weight))
            .collect();

        let mut result = ComboScore {
            signal_count: observations.len(),
            ..ComboScore::default()
        };

        for observation in observations {
            let Some(weight) = weights.get(&observation.signal_type).copied() else {
                continue;
            };
            match determine_signal_action(observation.signal_type, observation.signal_value) {
                SignalAction::Buy => {
                    result.buy_score += observation.signal_value * weight;
                    result.buy_signals += 1;
                }
                SignalAction::Sell => {
                    result.sell_score += observation.signal_value.abs() * weight;
                    result.sell_signals += 1;
                }
                SignalAction::Hold => {
                    result.neutral_score += NEUTRAL_INCREMENT * weight;
                }
            }
        }

        result.score = (result.buy_score - result.sell_score) / observations.len().max(1) as f64;
        result
    }

    /// Scores every day present in `observations`, oldest first.
    pub fn score_series(
        combo: &SignalCombination,
        stock_code: &str,
        observations: &[SignalObservation],
    ) -> Vec<ComboResult> {
        let mut by_date: BTreeMap<NaiveDate, Vec<SignalObservation>> = BTreeMap::new();
        for observation in observations
            .iter()
            .filter(|obs| obs.stock_code == stock_code)
        {
            by_date
                .entry(observation.date)
                .or_default()
                .push(observation.clone());
        }

        by_date
            .into_iter()
            .map(|(date, day)| {
                let breakdown = Self::breakdown(combo, &day);
                ComboResult {
                    combo_id: combo.id,
                    combo_name: combo.name.clone(),
                    stock_code: stock_code.to_string(),
                    date,
                    score: breakdown.score,
                    signal_count: breakdown.signal_count as i32,
                    buy_signals: breakdown.buy_signals as i32,
                    sell_signals: breakdown.sell_signals as i32,
                    description: format!(
                        "{}: {} buy / {} sell of {} signals",
                        combo.name,
                        breakdown.buy_signals,
                        breakdown.sell_signals,
                        breakdown.signal_count
                    ),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SignalDefinition;

    fn obs(day: u32, signal_type: SignalType, value: f64) -> SignalObservation {
        SignalObservation {
            stock_code: "600000".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            signal_type,
            signal_value: value,
            description: None,
        }
    }

    fn two_signal_combo() -> SignalCombination {
        SignalCombination::new("pair", "")
            .with_member(SignalType::Rsi, 1.0)
            .with_member(SignalType::Kdj, 2.0)
    }

    #[test]
    fn buy_and_sell_contributions_are_normalized() {
        let observations = vec![obs(1, SignalType::Rsi, 0.6), obs(1, SignalType::Kdj, -0.6)];
        let score = ComboScorer::score(&two_signal_combo(), &observations);
        assert!((score - -0.3).abs() < 1e-12);
    }

    #[test]
    fn band_width_buy_keeps_its_sign() {
        let combo = SignalCombination::new("bands", "").with_member(SignalType::BollWidth, 1.0);
        let breakdown = ComboScorer::breakdown(&combo, &[obs(1, SignalType::BollWidth, -0.5)]);
        assert_eq!(breakdown.buy_signals, 1);
        assert!((breakdown.buy_score - -0.5).abs() < 1e-12);
        assert!((breakdown.score - -0.5).abs() < 1e-12);
    }

    #[test]
    fn empty_day_scores_zero() {
        assert_eq!(ComboScorer::score(&two_signal_combo(), &[]), 0.0);
    }

    #[test]
    fn disabled_and_foreign_members_do_not_contribute() {
        let mut combo = two_signal_combo();
        combo.members[1] = SignalDefinition {
            enabled: false,
            ..combo.members[1].clone()
        };
        let observations = vec![
            obs(1, SignalType::Rsi, 0.8),
            obs(1, SignalType::Kdj, -0.9),
            obs(1, SignalType::Cci, -0.9),
        ];
        let breakdown = ComboScorer::breakdown(&combo, &observations);
        assert_eq!(breakdown.sell_signals, 0);
        assert_eq!(breakdown.signal_count, 3);
        assert!((breakdown.score - 0.8 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn neutral_readings_are_tracked_but_not_scored() {
        let observations = vec![obs(1, SignalType::Rsi, 0.2), obs(1, SignalType::Kdj, 0.0)];
        let breakdown = ComboScorer::breakdown(&two_signal_combo(), &observations);
        assert_eq!(breakdown.score, 0.0);
        assert!((breakdown.neutral_score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn series_is_grouped_by_day_in_order() {
        let observations = vec![
            obs(5, SignalType::Rsi, 0.9),
            obs(2, SignalType::Kdj, -0.7),
            obs(5, SignalType::Kdj, 0.6),
        ];
        let results = ComboScorer::score_series(&two_signal_combo(), "600000", &observations);
        assert_eq!(results.len(), 2);
        assert!(results[0].date < results[1].date);
        assert_eq!(results[0].sell_signals, 1);
        assert_eq!(results[1].buy_signals, 2);
        assert!((results[1].score - (0.9 + 1.2) / 2.0).abs() < 1e-12);
    }
}
