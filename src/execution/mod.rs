pub mod controls;
pub mod entry_evaluator;
pub mod exit_evaluator;
pub mod order_router;
pub mod position_sizer;
pub mod registry;
pub mod risk;

pub use controls::{OperationModeController, SafeModeController};
pub use entry_evaluator::EntryEvaluator;
pub use exit_evaluator::ExitEvaluator;
pub use order_router::OrderRouter;
pub use position_sizer::{PositionSizer, SizingRejection};
pub use registry::PositionRegistry;
pub use risk::{PortfolioRiskEnforcer, RiskStatus};
