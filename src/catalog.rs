use crate::error::{BacktestError, Result};
use crate::signals::SignalType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const COMPREHENSIVE_COMBINATION: &str = "comprehensive";
pub const TREND_FOLLOWING_COMBINATION: &str = "trend-following";
pub const OSCILLATION_COMBINATION: &str = "oscillation";

const DEFAULT_WEIGHTS: [(SignalType, f64, &str); 7] = [
    (SignalType::Macd, 1.2, "MACD trend weight"),
    (SignalType::Rsi, 1.0, "RSI oscillator weight"),
    (SignalType::Kdj, 0.8, "KDJ stochastic weight"),
    (SignalType::Boll, 0.9, "Bollinger band weight"),
    (SignalType::Cci, 0.7, "CCI channel weight"),
    (SignalType::Wr, 0.6, "Williams %R weight"),
    (SignalType::Ma, 0.5, "Moving average weight"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDefinition {
    pub signal_type: SignalType,
    pub weight: f64,
    pub enabled: bool,
    pub description: String,
}

impl SignalDefinition {
    pub fn new(signal_type: SignalType, weight: f64, description: impl Into<String>) -> Self {
        Self {
            signal_type,
            weight,
            enabled: true,
            description: description.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(BacktestError::invalid(format!(
                "weight for {} must be a finite non-negative number (value: {})",
                self.signal_type, self.weight
            )));
        }
        Ok(())
    }
}

/// A named weighted subset of the catalog. Member weights override the
/// catalog weight for the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalCombination {
    pub id: Option<i64>,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub members: Vec<SignalDefinition>,
}

impl SignalCombination {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: description.into(),
            enabled: true,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, signal_type: SignalType, weight: f64) -> Self {
        self.members.push(SignalDefinition::new(
            signal_type,
            weight,
            format!("{} weight", signal_type),
        ));
        self
    }

    pub fn enabled_members(&self) -> impl Iterator<Item = &SignalDefinition> {
        self.members.iter().filter(|member| member.enabled)
    }

    pub fn member_types(&self) -> Vec<SignalType> {
        self.enabled_members().map(|m| m.signal_type).collect()
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    signals: BTreeMap<SignalType, SignalDefinition>,
    combinations: BTreeMap<i64, SignalCombination>,
    next_combination_id: i64,
}

/// In-memory signal configuration shared across scorer and engine callers.
///
/// Readers always see a whole combination: member lists are swapped under a
/// single write lock and never patched in place.
#[derive(Debug, Default)]
pub struct SignalCatalog {
    state: RwLock<CatalogState>,
}

impl SignalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        catalog.seed_defaults();
        catalog
    }

    /// Builds a catalog from persisted rows. Combinations keep their ids.
    pub fn from_parts(
        signals: Vec<SignalDefinition>,
        combinations: Vec<SignalCombination>,
    ) -> Result<Self> {
        let catalog = Self::new();
        {
            let mut state = catalog.write();
            for definition in signals {
                definition.validate()?;
                state.signals.insert(definition.signal_type, definition);
            }
            for combination in combinations {
                let id = combination.id.ok_or_else(|| {
                    BacktestError::invalid(format!(
                        "persisted combination '{}' has no id",
                        combination.name
                    ))
                })?;
                validate_members(&state.signals, &combination)?;
                state.next_combination_id = state.next_combination_id.max(id);
                state.combinations.insert(id, combination);
            }
        }
        Ok(catalog)
    }

    /// Seeds default definitions and combinations. Returns false when the
    /// catalog already held signals and nothing was changed.
    pub fn seed_defaults(&self) -> bool {
        let mut state = self.write();
        if !state.signals.is_empty() {
            return false;
        }

        for signal_type in SignalType::ALL {
            state.signals.insert(
                signal_type,
                SignalDefinition {
                    signal_type,
                    weight: 1.0,
                    enabled: false,
                    description: format!("{} weight", signal_type),
                },
            );
        }
        for (signal_type, weight, description) in DEFAULT_WEIGHTS {
            state.signals.insert(
                signal_type,
                SignalDefinition::new(signal_type, weight, description),
            );
        }

        for combination in default_combinations() {
            state.next_combination_id += 1;
            let id = state.next_combination_id;
            state.combinations.insert(
                id,
                SignalCombination {
                    id: Some(id),
                    ..combination
                },
            );
        }
        log::debug!(
            "Seeded signal catalog with {} signals and {} combinations",
            state.signals.len(),
            state.combinations.len()
        );
        true
    }

    pub fn list_signals(&self) -> Vec<SignalDefinition> {
        self.read().signals.values().cloned().collect()
    }

    pub fn signal(&self, signal_type: SignalType) -> Option<SignalDefinition> {
        self.read().signals.get(&signal_type).cloned()
    }

    pub fn list_combinations(&self) -> Vec<SignalCombination> {
        self.read().combinations.values().cloned().collect()
    }

    pub fn combination(&self, id: i64) -> Option<SignalCombination> {
        self.read().combinations.get(&id).cloned()
    }

    pub fn combination_by_name(&self, name: &str) -> Option<SignalCombination> {
        self.read()
            .combinations
            .values()
            .find(|combo| combo.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn update_signal(&self, definition: SignalDefinition) -> Result<()> {
        definition.validate()?;
        let mut state = self.write();
        match state.signals.get_mut(&definition.signal_type) {
            Some(existing) => {
                *existing = definition;
                Ok(())
            }
            None => Err(BacktestError::not_found(
                "signal",
                definition.signal_type.as_str(),
            )),
        }
    }

    /// Inserts a new combination (`id == None`) or replaces an existing one
    /// wholesale, member list included. Returns the stored id.
    pub fn upsert_combination(&self, combination: SignalCombination) -> Result<i64> {
        if combination.name.trim().is_empty() {
            return Err(BacktestError::invalid("combination name must not be empty"));
        }

        let mut state = self.write();
        validate_members(&state.signals, &combination)?;

        let id = match combination.id {
            Some(id) => {
                if !state.combinations.contains_key(&id) {
                    return Err(BacktestError::not_found("combination", id.to_string()));
                }
                id
            }
            None => {
                state.next_combination_id += 1;
                state.next_combination_id
            }
        };

        state.combinations.insert(
            id,
            SignalCombination {
                id: Some(id),
                ..combination
            },
        );
        Ok(id)
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_members(
    signals: &BTreeMap<SignalType, SignalDefinition>,
    combination: &SignalCombination,
) -> Result<()> {
    let mut seen = HashSet::new();
    for member in &combination.members {
        member.validate()?;
        if !signals.contains_key(&member.signal_type) {
            return Err(BacktestError::invalid(format!(
                "combination '{}' references unknown signal type {}",
                combination.name, member.signal_type
            )));
        }
        if !seen.insert(member.signal_type) {
            return Err(BacktestError::invalid(format!(
                "combination '{}' lists {} more than once",
                combination.name, member.signal_type
            )));
        }
    }
    Ok(())
}

pub fn default_combinations() -> Vec<SignalCombination> {
    let mut comprehensive = SignalCombination::new(
        COMPREHENSIVE_COMBINATION,
        "Multi-indicator strategy combining trend, oscillator and band readings",
    );
    for (signal_type, weight, description) in DEFAULT_WEIGHTS {
        comprehensive
            .members
            .push(SignalDefinition::new(signal_type, weight, description));
    }

    let trend_following = SignalCombination::new(
        TREND_FOLLOWING_COMBINATION,
        "Trend strategy led by MACD and moving averages",
    )
    .with_member(SignalType::Macd, 1.5)
    .with_member(SignalType::Ma, 1.0)
    .with_member(SignalType::Rsi, 0.5);

    let oscillation = SignalCombination::new(
        OSCILLATION_COMBINATION,
        "Overbought/oversold strategy for range-bound markets",
    )
    .with_member(SignalType::Rsi, 1.5)
    .with_member(SignalType::Wr, 1.2)
    .with_member(SignalType::Cci, 1.0);

    vec![comprehensive, trend_following, oscillation]
}
