pub mod document;
pub mod service;

pub use document::{
    EntryType, PortfolioRisk, PositionDirection, Posture, StopLoss, StrategyDocument,
    StrategyPosition, TakeProfitTarget,
};
pub use service::{StrategyService, StrategySnapshot, StrategyState};
