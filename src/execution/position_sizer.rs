use tracing::debug;

/// Why a computed size was refused. Surfaced as the entry_skipped reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingRejection {
    InsufficientCapital,
    BelowMinimum,
}

impl SizingRejection {
    pub fn as_reason(self) -> &'static str {
        match self {
            SizingRejection::InsufficientCapital => "insufficient_capital",
            SizingRejection::BelowMinimum => "below_min",
        }
    }
}

/// Order sizing: available cash times the declared allocation, divided by
/// the reference price, constrained by the per-position exposure cap and
/// the venue minimum.
pub struct PositionSizer;

impl PositionSizer {
    pub fn size_entry(
        available_cash: f64,
        portfolio_value: f64,
        allocation_pct: f64,
        max_per_position_pct: f64,
        reference_price: f64,
        min_quantity: f64,
    ) -> Result<f64, SizingRejection> {
        if available_cash <= 0.0 || reference_price <= 0.0 {
            return Err(SizingRejection::InsufficientCapital);
        }

        let mut notional = available_cash * allocation_pct;
        let per_position_cap = portfolio_value * max_per_position_pct;
        if per_position_cap > 0.0 && notional > per_position_cap {
            debug!(
                "Sizing capped by max_per_position: {:.2} -> {:.2}",
                notional, per_position_cap
            );
            notional = per_position_cap;
        }
        if notional > available_cash {
            return Err(SizingRejection::InsufficientCapital);
        }

        let quantity = notional / reference_price;
        if quantity <= 0.0 {
            return Err(SizingRejection::InsufficientCapital);
        }
        if quantity < min_quantity {
            return Err(SizingRejection::BelowMinimum);
        }
        Ok(quantity)
    }
}
