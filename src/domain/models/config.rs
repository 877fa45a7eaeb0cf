use serde::{Deserialize, Serialize};

use super::decision::ScoringWeights;
use super::fleet::LoadPriority;

/// Main configuration structure for the fleet loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Cycle timing and orchestration
    #[serde(default, rename = "loop")]
    pub control: LoopConfig,

    /// Telemetry validation and GPS-derived state
    #[serde(default)]
    pub observation: ObservationConfig,

    /// Reasoning stage thresholds
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Route cost model and optimizer budget
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Load assignment constraints
    #[serde(default)]
    pub assignment: AssignmentConfig,

    /// Decision scoring and approval policy
    #[serde(default)]
    pub decision: DecisionConfig,

    /// Feedback learning parameters
    #[serde(default)]
    pub learning: LearningConfig,

    /// Retry policy for store and oracle calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Reasoning oracle backend
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoopConfig {
    /// Stop after this many cycles (None runs until stopped)
    #[serde(default)]
    pub max_cycles: Option<u64>,

    /// Pause between cycles in seconds
    #[serde(default = "default_cycle_interval_seconds")]
    pub cycle_interval_seconds: u64,

    /// Upper bound on each phase in seconds
    #[serde(default = "default_phase_timeout_seconds")]
    pub phase_timeout_seconds: u64,

    /// Grant low-confidence approvals automatically
    #[serde(default)]
    pub auto_approve: bool,

    /// How long a deferred decision waits for approval before expiring
    #[serde(default = "default_approval_ttl_seconds")]
    pub approval_ttl_seconds: u64,

    /// Concurrent scenario planners in the PLAN phase
    #[serde(default = "default_plan_workers")]
    pub plan_workers: usize,

    /// Directory for persisted cycle state when using the file store
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

const fn default_cycle_interval_seconds() -> u64 {
    5
}

const fn default_phase_timeout_seconds() -> u64 {
    30
}

const fn default_approval_ttl_seconds() -> u64 {
    900
}

const fn default_plan_workers() -> usize {
    4
}

fn default_state_dir() -> String {
    ".fleet/state".to_string()
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_cycles: None,
            cycle_interval_seconds: default_cycle_interval_seconds(),
            phase_timeout_seconds: default_phase_timeout_seconds(),
            auto_approve: false,
            approval_ttl_seconds: default_approval_ttl_seconds(),
            plan_workers: default_plan_workers(),
            state_dir: default_state_dir(),
        }
    }
}

/// OBSERVE-stage telemetry checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ObservationConfig {
    /// Readings faster than this are discarded as sensor noise
    #[serde(default = "default_max_speed_kmh")]
    pub max_speed_kmh: f64,

    /// How far ahead of the snapshot clock a reading may be stamped
    #[serde(default = "default_max_clock_skew_seconds")]
    pub max_clock_skew_seconds: i64,

    /// Speed under which a reading counts toward a stuck truck
    #[serde(default = "default_stuck_speed_kmh")]
    pub stuck_speed_kmh: f64,

    /// Consecutive slow readings that mark an en-route truck stuck
    #[serde(default = "default_stuck_readings")]
    pub stuck_readings: usize,
}

const fn default_max_speed_kmh() -> f64 {
    200.0
}

const fn default_max_clock_skew_seconds() -> i64 {
    300
}

const fn default_stuck_speed_kmh() -> f64 {
    5.0
}

const fn default_stuck_readings() -> usize {
    5
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: default_max_speed_kmh(),
            max_clock_skew_seconds: default_max_clock_skew_seconds(),
            stuck_speed_kmh: default_stuck_speed_kmh(),
            stuck_readings: default_stuck_readings(),
        }
    }
}

/// Reasoning stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReasoningConfig {
    /// Overall budget for the oracle call, retries included
    #[serde(default = "default_oracle_timeout_seconds")]
    pub oracle_timeout_seconds: u64,

    /// Lowest confidence accepted from the oracle
    #[serde(default = "default_oracle_confidence_floor")]
    pub oracle_confidence_floor: f64,

    /// Confidence attached to rule-based issues; must stay below the floor
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,

    /// Loaded trucks stationary longer than this are reported
    #[serde(default = "default_stationary_threshold_minutes")]
    pub stationary_threshold_minutes: f64,

    /// Unassigned loads whose window closes within this horizon are at risk
    #[serde(default = "default_risk_horizon_minutes")]
    pub risk_horizon_minutes: f64,

    /// Fuel fraction below which a truck is reported
    #[serde(default = "default_low_fuel_fraction")]
    pub low_fuel_fraction: f64,

    /// Congested segments on one route before a traffic issue is raised
    #[serde(default = "default_heavy_segment_threshold")]
    pub heavy_segment_threshold: usize,
}

const fn default_oracle_timeout_seconds() -> u64 {
    10
}

const fn default_oracle_confidence_floor() -> f64 {
    0.5
}

const fn default_fallback_confidence() -> f64 {
    0.3
}

const fn default_stationary_threshold_minutes() -> f64 {
    30.0
}

const fn default_risk_horizon_minutes() -> f64 {
    120.0
}

const fn default_low_fuel_fraction() -> f64 {
    0.2
}

const fn default_heavy_segment_threshold() -> usize {
    3
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            oracle_timeout_seconds: default_oracle_timeout_seconds(),
            oracle_confidence_floor: default_oracle_confidence_floor(),
            fallback_confidence: default_fallback_confidence(),
            stationary_threshold_minutes: default_stationary_threshold_minutes(),
            risk_horizon_minutes: default_risk_horizon_minutes(),
            low_fuel_fraction: default_low_fuel_fraction(),
            heavy_segment_threshold: default_heavy_segment_threshold(),
        }
    }
}

/// Route cost model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RoutingConfig {
    /// Candidate swaps evaluated by 2-opt before giving up
    #[serde(default = "default_two_opt_iteration_budget")]
    pub two_opt_iteration_budget: u32,

    /// Traffic factor applied to standstill segments
    #[serde(default = "default_standstill_factor")]
    pub standstill_factor: f64,

    #[serde(default = "default_average_speed_kmh")]
    pub average_speed_kmh: f64,

    #[serde(default = "default_fuel_l_per_km")]
    pub fuel_l_per_km: f64,

    #[serde(default = "default_fuel_price_per_l")]
    pub fuel_price_per_l: f64,

    #[serde(default = "default_driver_cost_per_hour")]
    pub driver_cost_per_hour: f64,

    #[serde(default = "default_vehicle_cost_per_hour")]
    pub vehicle_cost_per_hour: f64,

    /// Minutes spent at each stop
    #[serde(default = "default_service_minutes")]
    pub service_minutes: f64,
}

const fn default_two_opt_iteration_budget() -> u32 {
    1000
}

const fn default_standstill_factor() -> f64 {
    3.0
}

const fn default_average_speed_kmh() -> f64 {
    60.0
}

const fn default_fuel_l_per_km() -> f64 {
    0.3
}

const fn default_fuel_price_per_l() -> f64 {
    1.5
}

const fn default_driver_cost_per_hour() -> f64 {
    25.0
}

const fn default_vehicle_cost_per_hour() -> f64 {
    10.0
}

const fn default_service_minutes() -> f64 {
    15.0
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            two_opt_iteration_budget: default_two_opt_iteration_budget(),
            standstill_factor: default_standstill_factor(),
            average_speed_kmh: default_average_speed_kmh(),
            fuel_l_per_km: default_fuel_l_per_km(),
            fuel_price_per_l: default_fuel_price_per_l(),
            driver_cost_per_hour: default_driver_cost_per_hour(),
            vehicle_cost_per_hour: default_vehicle_cost_per_hour(),
            service_minutes: default_service_minutes(),
        }
    }
}

/// Load assignment constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AssignmentConfig {
    /// Maximum distance from truck to pickup
    #[serde(default = "default_search_radius_km")]
    pub search_radius_km: f64,

    /// Share of the fuel on board that may be planned against
    #[serde(default = "default_usable_fuel_fraction")]
    pub usable_fuel_fraction: f64,

    /// Cost adjustment for critical loads (negative prefers them)
    #[serde(default = "default_critical_discount")]
    pub critical_discount: f64,

    #[serde(default = "default_urgent_discount")]
    pub urgent_discount: f64,

    #[serde(default = "default_high_discount")]
    pub high_discount: f64,
}

const fn default_search_radius_km() -> f64 {
    150.0
}

const fn default_usable_fuel_fraction() -> f64 {
    0.8
}

const fn default_critical_discount() -> f64 {
    -500.0
}

const fn default_urgent_discount() -> f64 {
    -250.0
}

const fn default_high_discount() -> f64 {
    -50.0
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            search_radius_km: default_search_radius_km(),
            usable_fuel_fraction: default_usable_fuel_fraction(),
            critical_discount: default_critical_discount(),
            urgent_discount: default_urgent_discount(),
            high_discount: default_high_discount(),
        }
    }
}

/// Decision scoring and approval policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DecisionConfig {
    /// Decisions below this confidence need human approval
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,

    /// Reassign/dispatch of loads at or above this priority needs approval
    #[serde(default = "default_high_impact_priority")]
    pub high_impact_priority: LoadPriority,

    /// Starting weights; the feedback stage adjusts them at runtime
    #[serde(default)]
    pub weights: ScoringWeights,
}

const fn default_approval_threshold() -> f64 {
    0.6
}

const fn default_high_impact_priority() -> LoadPriority {
    LoadPriority::Critical
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
            high_impact_priority: default_high_impact_priority(),
            weights: ScoringWeights::default(),
        }
    }
}

/// Feedback learning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LearningConfig {
    /// Step per unit of relative deviation
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Largest change to a single weight per outcome
    #[serde(default = "default_max_step")]
    pub max_step: f64,

    /// Floor applied before renormalizing
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,

    /// Deviations within this percentage are ignored
    #[serde(default = "default_tolerance_pct")]
    pub tolerance_pct: f64,

    /// Outcomes kept for the rolling success rate
    #[serde(default = "default_success_window")]
    pub success_window: usize,
}

const fn default_learning_rate() -> f64 {
    0.05
}

const fn default_max_step() -> f64 {
    0.05
}

const fn default_min_weight() -> f64 {
    0.05
}

const fn default_tolerance_pct() -> f64 {
    10.0
}

const fn default_success_window() -> usize {
    50
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            max_step: default_max_step(),
            min_weight: default_min_weight(),
            tolerance_pct: default_tolerance_pct(),
            success_window: default_success_window(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Which oracle backs the reasoning stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    /// No oracle; always use the rule-based fallback
    Rules,
    /// JSON-over-HTTP judgment service
    Http,
}

impl OracleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rules => "rules",
            Self::Http => "http",
        }
    }
}

/// Reasoning oracle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OracleConfig {
    #[serde(default = "default_oracle_kind")]
    pub kind: OracleKind,

    /// Endpoint receiving situation/schema POSTs
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Model name forwarded to the service
    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

const fn default_oracle_kind() -> OracleKind {
    OracleKind::Rules
}

fn default_api_key_env() -> String {
    "FLEET_ORACLE_API_KEY".to_string()
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: default_oracle_kind(),
            endpoint: None,
            model: None,
            api_key_env: default_api_key_env(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files (stdout only when unset)
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
