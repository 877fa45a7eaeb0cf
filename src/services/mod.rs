pub mod action_executor;
pub mod approval_queue;
pub mod decision_selector;
pub mod event_bus;
pub mod feedback_stage;
pub mod load_assignment;
pub mod observation;
pub mod reasoning_stage;
pub mod route_optimizer;
pub mod scenario_planner;

pub use action_executor::ActionExecutor;
pub use approval_queue::{ApprovalError, ApprovalQueue};
pub use decision_selector::{score_scenario, DecisionSelector};
pub use event_bus::{EventBus, EventBusConfig, EventPayload, EventSeverity, FleetEvent, SequenceNumber};
pub use feedback_stage::FeedbackStage;
pub use load_assignment::{
    Assignment, AssignmentOutcome, LoadAssignmentEngine, RejectionReason, Unassignable,
};
pub use observation::{ObservationPreprocessor, ObservationReport};
pub use reasoning_stage::{judgment_schema, ReasoningStage};
pub use route_optimizer::{OptimizationOutcome, OptimizedRoute, RouteLeg, RouteOptimizer};
pub use scenario_planner::ScenarioPlanner;
