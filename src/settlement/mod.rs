//! Match settlement: the state machine service and its job orchestrator.
//!
//! `service` never touches the queue; `orchestrator` depends on both.

pub mod orchestrator;
pub mod picks;
pub mod service;

pub use orchestrator::{Ingested, ScanReport, SettlementOrchestrator};
pub use picks::{CorrectPickEvaluator, PickError, PicksEvaluator};
pub use service::{
    MatchSnapshot, NotReadyReason, SettleOutcome, SettlementResult, SettlementService,
    VoidOutcome, VoidResult,
};
