use crate::dsl::Condition;
use crate::models::{TradeMode, TradingError, TradingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Operator/strategy signal that scales or halts execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Aggressive,
    Moderate,
    Defensive,
    Flat,
    ExitAll,
}

impl Posture {
    /// Flat and exit_all halt new entries entirely.
    pub fn allows_entries(self) -> bool {
        !matches!(self, Posture::Flat | Posture::ExitAll)
    }
}

impl std::fmt::Display for Posture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Posture::Aggressive => "aggressive",
            Posture::Moderate => "moderate",
            Posture::Defensive => "defensive",
            Posture::Flat => "flat",
            Posture::ExitAll => "exit_all",
        };
        write!(f, "{}", s)
    }
}

/// Hard portfolio limits the risk enforcer gates entries on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRisk {
    pub max_drawdown_pct: f64,
    pub daily_loss_limit_usd: f64,
    pub max_total_exposure_pct: f64,
    pub max_per_position_pct: f64,
}

/// Declared direction. `close` demands closure of the matching open
/// position; it never opens anything.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionDirection {
    Long,
    Short,
    Close,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Market,
    Limit,
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: f64,
    pub close_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StopLoss {
    Hard { price: f64 },
    Trailing { trail_pct: f64 },
}

/// One declared position intent. Immutable across its parent document's
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPosition {
    pub id: String,
    pub asset: String,
    pub direction: PositionDirection,
    #[serde(default)]
    pub allocation_pct: f64,
    pub entry_type: EntryType,
    #[serde(default)]
    pub entry_limit_price: Option<f64>,
    #[serde(default)]
    pub entry_condition: Option<String>,
    #[serde(default)]
    pub take_profit_targets: Vec<TakeProfitTarget>,
    #[serde(default)]
    pub stop_loss: Option<StopLoss>,
    #[serde(default)]
    pub time_exit_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalidation_condition: Option<String>,
}

impl StrategyPosition {
    fn validate(&self) -> TradingResult<()> {
        let reject = |msg: String| {
            Err(TradingError::ValidationError(format!(
                "position '{}': {}",
                self.id, msg
            )))
        };

        if self.id.trim().is_empty() {
            return Err(TradingError::ValidationError(
                "position with empty id".to_string(),
            ));
        }
        if self.asset.trim().is_empty() {
            return reject("empty asset".to_string());
        }

        if self.direction != PositionDirection::Close
            && (self.allocation_pct <= 0.0 || self.allocation_pct > 1.0)
        {
            return reject(format!(
                "allocation_pct {} outside (0, 1]",
                self.allocation_pct
            ));
        }

        match self.entry_type {
            EntryType::Market => {}
            EntryType::Limit => match self.entry_limit_price {
                Some(p) if p > 0.0 => {}
                _ => return reject("limit entry requires entry_limit_price > 0".to_string()),
            },
            EntryType::Conditional => match &self.entry_condition {
                Some(src) => {
                    Condition::parse(src).map_err(|e| {
                        TradingError::ValidationError(format!("position '{}': {}", self.id, e))
                    })?;
                }
                None => return reject("conditional entry requires entry_condition".to_string()),
            },
        }

        let mut close_pct_sum = 0.0;
        for (i, target) in self.take_profit_targets.iter().enumerate() {
            if target.price <= 0.0 {
                return reject(format!("take_profit target {} price must be > 0", i));
            }
            if target.close_pct <= 0.0 || target.close_pct > 1.0 {
                return reject(format!(
                    "take_profit target {} close_pct {} outside (0, 1]",
                    i, target.close_pct
                ));
            }
            close_pct_sum += target.close_pct;
        }
        if close_pct_sum > 1.0 + 1e-9 {
            return reject(format!(
                "take_profit close_pct sum {:.4} exceeds 1",
                close_pct_sum
            ));
        }

        match &self.stop_loss {
            Some(StopLoss::Hard { price }) if *price <= 0.0 => {
                return reject("hard stop requires price > 0".to_string());
            }
            Some(StopLoss::Trailing { trail_pct }) if *trail_pct <= 0.0 => {
                return reject("trailing stop requires trail_pct > 0".to_string());
            }
            _ => {}
        }

        // Price-ordering invariants. Fully checkable only when the entry
        // price is declared (limit entries); the hard-stop/take-profit
        // ordering is checkable regardless.
        let is_long = self.direction == PositionDirection::Long;
        let is_short = self.direction == PositionDirection::Short;
        if is_long || is_short {
            if let Some(StopLoss::Hard { price: stop }) = &self.stop_loss {
                for (i, target) in self.take_profit_targets.iter().enumerate() {
                    let ordered = if is_long {
                        stop < &target.price
                    } else {
                        stop > &target.price
                    };
                    if !ordered {
                        return reject(format!(
                            "hard stop {} not on the losing side of take_profit target {} ({})",
                            stop, i, target.price
                        ));
                    }
                }
                if let Some(entry) = self.entry_limit_price {
                    let ordered = if is_long { *stop < entry } else { *stop > entry };
                    if !ordered {
                        return reject(format!(
                            "hard stop {} not on the losing side of entry {}",
                            stop, entry
                        ));
                    }
                }
            }
            if let Some(entry) = self.entry_limit_price {
                for (i, target) in self.take_profit_targets.iter().enumerate() {
                    let ordered = if is_long {
                        target.price > entry
                    } else {
                        target.price < entry
                    };
                    if !ordered {
                        return reject(format!(
                            "take_profit target {} ({}) not on the winning side of entry {}",
                            i, target.price, entry
                        ));
                    }
                }
            }
        }

        if let Some(src) = &self.invalidation_condition {
            Condition::parse(src).map_err(|e| {
                TradingError::ValidationError(format!("position '{}': {}", self.id, e))
            })?;
        }

        Ok(())
    }

    /// Assets this position touches: its own plus any referenced by its
    /// conditions.
    pub fn referenced_assets(&self) -> BTreeSet<String> {
        let mut assets = BTreeSet::new();
        assets.insert(self.asset.clone());
        for src in [&self.entry_condition, &self.invalidation_condition]
            .into_iter()
            .flatten()
        {
            if let Ok(cond) = Condition::parse(src) {
                assets.extend(cond.assets());
            }
        }
        assets
    }
}

/// The control input of the execution engine. Created by the synthesis
/// agent, validated on load, replaced atomically, expires at
/// `validity_window`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDocument {
    /// Content-derived id: first 16 hex chars of SHA-256 over the file
    /// bytes. Not part of the serialised document.
    #[serde(skip)]
    pub id: String,
    pub mode: TradeMode,
    pub posture: Posture,
    pub validity_window: DateTime<Utc>,
    pub portfolio_risk: PortfolioRisk,
    #[serde(default)]
    pub positions: Vec<StrategyPosition>,
}

impl StrategyDocument {
    pub fn content_id(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..16].to_string()
    }

    /// Parse the canonical file bytes, stamping the content-derived id.
    /// Unknown fields are ignored. Does not validate; call `validate`.
    pub fn from_bytes(bytes: &[u8]) -> TradingResult<Self> {
        let mut doc: StrategyDocument = serde_json::from_slice(bytes)
            .map_err(|e| TradingError::ValidationError(format!("invalid strategy JSON: {}", e)))?;
        doc.id = Self::content_id(bytes);
        Ok(doc)
    }

    pub fn validate(&self, now: DateTime<Utc>) -> TradingResult<()> {
        if self.validity_window <= now {
            return Err(TradingError::ValidationError(format!(
                "validity_window {} is not in the future",
                self.validity_window
            )));
        }

        let risk = &self.portfolio_risk;
        for (name, value) in [
            ("max_drawdown_pct", risk.max_drawdown_pct),
            ("max_total_exposure_pct", risk.max_total_exposure_pct),
            ("max_per_position_pct", risk.max_per_position_pct),
        ] {
            if value <= 0.0 || value > 1.0 {
                return Err(TradingError::ValidationError(format!(
                    "portfolio_risk.{} {} outside (0, 1]",
                    name, value
                )));
            }
        }
        if risk.daily_loss_limit_usd < 0.0 {
            return Err(TradingError::ValidationError(format!(
                "portfolio_risk.daily_loss_limit_usd {} is negative",
                risk.daily_loss_limit_usd
            )));
        }

        if self.positions.is_empty() && self.posture.allows_entries() {
            return Err(TradingError::ValidationError(format!(
                "posture {} requires at least one position",
                self.posture
            )));
        }

        let mut seen = BTreeSet::new();
        for position in &self.positions {
            position.validate()?;
            if !seen.insert(position.id.clone()) {
                return Err(TradingError::ValidationError(format!(
                    "duplicate position id '{}'",
                    position.id
                )));
            }
        }

        Ok(())
    }

    /// Union of all assets the document references. The market-data hub
    /// subscribes to exactly this set.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for position in &self.positions {
            out.extend(position.referenced_assets());
        }
        out
    }

    pub fn position(&self, strategy_position_id: &str) -> Option<&StrategyPosition> {
        self.positions
            .iter()
            .find(|p| p.id == strategy_position_id)
    }
}
