//! Condition predicates over market snapshots.
//!
//! Strategy documents carry short textual predicates like
//! `AND(rsi(14, BTC/USD) < 30, price(BTC/USD) > 40000)`. They are compiled
//! once at strategy load into an evaluator tree; every tick pays only
//! evaluation cost. Evaluation is three-valued: a leaf whose asset has no
//! snapshot yet, or whose indicator key is absent, reports `NotReady`
//! instead of guessing.

pub mod parser;

use crate::models::SnapshotMap;
use crate::models::{TradingError, TradingResult};
use std::collections::BTreeSet;

/// Three-valued evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    True,
    False,
    NotReady,
}

impl From<bool> for Tri {
    fn from(b: bool) -> Self {
        if b {
            Tri::True
        } else {
            Tri::False
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossDirection {
    Above,
    Below,
}

/// Left-hand side of a comparison: the asset's price, or a named indicator
/// scalar. Indicator keys are canonical (`RSI_14`, `EMA_50_200`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Price { asset: String },
    Indicator { key: String, asset: String },
}

impl Operand {
    pub fn asset(&self) -> &str {
        match self {
            Operand::Price { asset } => asset,
            Operand::Indicator { asset, .. } => asset,
        }
    }

    /// Resolve against the snapshot map; `None` means not ready.
    fn resolve(&self, snapshots: &SnapshotMap) -> Option<f64> {
        match self {
            Operand::Price { asset } => snapshots.get(asset).map(|s| s.mid()),
            Operand::Indicator { key, asset } => snapshots
                .get(asset)
                .and_then(|s| s.indicators.get(key))
                .copied(),
        }
    }
}

/// Evaluator tree node. Crossing nodes are stateful: they remember the
/// previous boolean of the underlying comparison and fire only on the edge
/// in the commanded direction.
#[derive(Debug, Clone)]
pub enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Compare {
        operand: Operand,
        op: CmpOp,
        value: f64,
    },
    Cross {
        operand: Operand,
        direction: CrossDirection,
        value: f64,
        prev: Option<bool>,
    },
}

impl Node {
    /// Evaluate the node. Every child is evaluated unconditionally so that
    /// crossing state advances on each tick regardless of sibling results.
    fn evaluate(&mut self, snapshots: &SnapshotMap) -> Tri {
        match self {
            Node::And(children) => {
                let results: Vec<Tri> =
                    children.iter_mut().map(|c| c.evaluate(snapshots)).collect();
                if results.iter().any(|r| *r == Tri::NotReady) {
                    Tri::NotReady
                } else {
                    Tri::from(results.iter().all(|r| *r == Tri::True))
                }
            }
            Node::Or(children) => {
                let results: Vec<Tri> =
                    children.iter_mut().map(|c| c.evaluate(snapshots)).collect();
                if results.iter().any(|r| *r == Tri::True) {
                    Tri::True
                } else if results.iter().all(|r| *r == Tri::False) {
                    Tri::False
                } else {
                    Tri::NotReady
                }
            }
            Node::Not(child) => match child.evaluate(snapshots) {
                Tri::True => Tri::False,
                Tri::False => Tri::True,
                Tri::NotReady => Tri::NotReady,
            },
            Node::Compare { operand, op, value } => match operand.resolve(snapshots) {
                Some(lhs) => Tri::from(op.apply(lhs, *value)),
                None => Tri::NotReady,
            },
            Node::Cross {
                operand,
                direction,
                value,
                prev,
            } => {
                let current = match operand.resolve(snapshots) {
                    Some(lhs) => match direction {
                        CrossDirection::Above => lhs > *value,
                        CrossDirection::Below => lhs < *value,
                    },
                    None => return Tri::NotReady,
                };
                let fired = match *prev {
                    // First evaluable tick establishes the baseline.
                    None => false,
                    Some(was) => !was && current,
                };
                *prev = Some(current);
                Tri::from(fired)
            }
        }
    }

    fn collect_assets(&self, out: &mut BTreeSet<String>) {
        match self {
            Node::And(children) | Node::Or(children) => {
                for c in children {
                    c.collect_assets(out);
                }
            }
            Node::Not(child) => child.collect_assets(out),
            Node::Compare { operand, .. } | Node::Cross { operand, .. } => {
                out.insert(operand.asset().to_string());
            }
        }
    }
}

/// A compiled predicate. Holds per-condition crossing state, so a single
/// instance must not be evaluated from two tasks concurrently; each
/// evaluator compiles its own copy from the source text.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    root: Node,
}

impl Condition {
    pub fn parse(input: &str) -> TradingResult<Self> {
        let root = parser::parse(input)
            .map_err(|e| TradingError::ConditionParseError(format!("{}: {}", input.trim(), e)))?;
        Ok(Self {
            source: input.trim().to_string(),
            root,
        })
    }

    pub fn evaluate(&mut self, snapshots: &SnapshotMap) -> Tri {
        self.root.evaluate(snapshots)
    }

    /// Assets the predicate references. The market-data hub subscribes to
    /// the union of these across the active strategy.
    pub fn assets(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.root.collect_assets(&mut out);
        out
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}
