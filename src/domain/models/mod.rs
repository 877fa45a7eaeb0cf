pub mod config;
pub mod control_loop;
pub mod decision;
pub mod feedback;
pub mod fleet;
pub mod geo;
pub mod issue;
pub mod scenario;

pub use config::{
    AssignmentConfig, Config, DecisionConfig, LearningConfig, LoggingConfig, LoopConfig,
    ObservationConfig, OracleConfig, OracleKind, ReasoningConfig, RetryConfig, RoutingConfig,
};
pub use control_loop::{ControlLoopState, LoopPhase, PhaseRecord};
pub use decision::{
    ActionResult, ActionStatus, ApprovalState, Decision, DecisionResult, PreImage, ScoredScenario,
    ScoringWeights,
};
pub use feedback::{FeedbackResult, LearningUpdate, ObservedOutcome, OutcomeMetrics, SystemHealth};
pub use fleet::{
    segment_key, FleetSnapshot, FleetState, GpsReading, Load, LoadPriority, LoadStatus, Route,
    Stop, StopArrival, StopKind, TimeWindow, TrafficCondition, TrafficIndex, TrafficLevel, Truck,
    TruckStatus,
};
pub use geo::Location;
pub use issue::{sort_issues, Issue, IssueType, JudgmentSource, ReasoningResult, Severity};
pub use scenario::{Action, ActionType, EntityRef, Scenario};
