use crate::catalog::{SignalCatalog, SignalCombination, SignalDefinition};
use crate::context::AppContext;
use crate::error::BacktestError;
use crate::signals::SignalType;
use anyhow::{anyhow, Result};
use log::info;
use std::str::FromStr;

/// A `TYPE=weight` member argument, e.g. `RSI=1.5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberWeight {
    pub signal_type: SignalType,
    pub weight: f64,
}

impl FromStr for MemberWeight {
    type Err = BacktestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (code, weight) = value
            .split_once('=')
            .or_else(|| value.split_once(':'))
            .ok_or_else(|| {
                BacktestError::invalid(format!(
                    "member must look like TYPE=weight (value: {})",
                    value
                ))
            })?;
        let signal_type = code.trim().parse::<SignalType>()?;
        let weight = weight.trim().parse::<f64>().map_err(|_| {
            BacktestError::invalid(format!("weight for {} must be a number (value: {})", code, weight))
        })?;
        Ok(Self {
            signal_type,
            weight,
        })
    }
}

pub struct UpsertCombinationRequest {
    pub id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub members: Vec<MemberWeight>,
    pub disabled: bool,
}

pub async fn list_signals(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    let catalog = db.load_catalog().await?;
    for definition in catalog.list_signals() {
        println!(
            "{:<16} weight {:>5.2}  {}  {}",
            definition.signal_type,
            definition.weight,
            if definition.enabled { "enabled " } else { "disabled" },
            definition.description
        );
    }
    Ok(())
}

pub async fn list_combinations(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    let catalog = db.load_catalog().await?;
    for combination in catalog.list_combinations() {
        println!(
            "[{}] {}{}: {}",
            combination.id.unwrap_or_default(),
            combination.name,
            if combination.enabled { "" } else { " (disabled)" },
            combination.description
        );
        for member in &combination.members {
            println!(
                "    {:<16} {:>5.2}{}",
                member.signal_type,
                member.weight,
                if member.enabled { "" } else { " (disabled)" }
            );
        }
    }
    Ok(())
}

pub async fn update_signal(
    app: &AppContext,
    signal_type: SignalType,
    weight: Option<f64>,
    enabled: Option<bool>,
    description: Option<String>,
) -> Result<()> {
    let db = app.database().await?;
    let catalog = db.load_catalog().await?;
    let updated = apply_signal_update(&catalog, signal_type, weight, enabled, description)?;
    db.update_signal_definition(&updated).await?;
    info!(
        "Updated {}: weight {}, {}",
        updated.signal_type,
        updated.weight,
        if updated.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

pub async fn upsert_combination(app: &AppContext, request: UpsertCombinationRequest) -> Result<()> {
    let mut db = app.database().await?;
    let catalog = db.load_catalog().await?;
    let combination = build_combination(&catalog, request)?;
    let id = db.upsert_signal_combination(&combination).await?;
    info!(
        "Stored combination '{}' (id {}) with {} member(s)",
        combination.name,
        id,
        combination.members.len()
    );
    Ok(())
}

/// Validates the change against the in-memory catalog and returns the
/// definition to persist.
fn apply_signal_update(
    catalog: &SignalCatalog,
    signal_type: SignalType,
    weight: Option<f64>,
    enabled: Option<bool>,
    description: Option<String>,
) -> Result<SignalDefinition> {
    let existing = catalog
        .signal(signal_type)
        .ok_or_else(|| BacktestError::not_found("signal", signal_type.as_str()))?;
    let updated = SignalDefinition {
        signal_type,
        weight: weight.unwrap_or(existing.weight),
        enabled: enabled.unwrap_or(existing.enabled),
        description: description.unwrap_or(existing.description),
    };
    catalog.update_signal(updated.clone())?;
    Ok(updated)
}

fn build_combination(
    catalog: &SignalCatalog,
    request: UpsertCombinationRequest,
) -> Result<SignalCombination> {
    if request.members.is_empty() {
        return Err(anyhow!("A combination needs at least one member"));
    }

    let description = match (request.description, request.id) {
        (Some(description), _) => description,
        (None, Some(id)) => catalog
            .combination(id)
            .map(|existing| existing.description)
            .unwrap_or_default(),
        (None, None) => String::new(),
    };

    let mut combination = SignalCombination::new(request.name, description);
    combination.id = request.id;
    combination.enabled = !request.disabled;
    for member in request.members {
        combination = combination.with_member(member.signal_type, member.weight);
    }

    catalog.upsert_combination(combination.clone())?;
    Ok(combination)
}
