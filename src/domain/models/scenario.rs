//! Candidate courses of action for an issue.

use serde::{Deserialize, Serialize};

use super::fleet::{LoadPriority, Stop};

/// Kind of corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Reroute,
    Reassign,
    Dispatch,
    Wait,
    Notify,
    Escalate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reroute => "reroute",
            Self::Reassign => "reassign",
            Self::Dispatch => "dispatch",
            Self::Wait => "wait",
            Self::Notify => "notify",
            Self::Escalate => "escalate",
        }
    }

    /// Whether executing this action mutates fleet records.
    pub fn mutates_fleet(&self) -> bool {
        matches!(self, Self::Reroute | Self::Reassign | Self::Dispatch)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fleet entity touched by an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Truck(String),
    Load(String),
}

/// One concrete action with the parameters needed to execute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Replace the truck's route with a new stop order.
    Reroute { truck_id: String, stops: Vec<Stop> },
    /// Move a load to another truck.
    Reassign {
        load_id: String,
        from_truck_id: Option<String>,
        to_truck_id: String,
        load_priority: LoadPriority,
    },
    /// Send a truck to collect a load on a new route.
    Dispatch {
        truck_id: String,
        load_id: String,
        stops: Vec<Stop>,
        load_priority: LoadPriority,
    },
    Wait {
        truck_id: Option<String>,
        duration_minutes: f64,
    },
    Notify { recipient: String, message: String },
    Escalate { reason: String },
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Reroute { .. } => ActionType::Reroute,
            Self::Reassign { .. } => ActionType::Reassign,
            Self::Dispatch { .. } => ActionType::Dispatch,
            Self::Wait { .. } => ActionType::Wait,
            Self::Notify { .. } => ActionType::Notify,
            Self::Escalate { .. } => ActionType::Escalate,
        }
    }

    /// Entities whose records this action would mutate.
    pub fn touched_entities(&self) -> Vec<EntityRef> {
        match self {
            Self::Reroute { truck_id, .. } => vec![EntityRef::Truck(truck_id.clone())],
            Self::Reassign {
                load_id,
                from_truck_id,
                to_truck_id,
                ..
            } => {
                let mut refs = vec![
                    EntityRef::Load(load_id.clone()),
                    EntityRef::Truck(to_truck_id.clone()),
                ];
                if let Some(from) = from_truck_id {
                    refs.push(EntityRef::Truck(from.clone()));
                }
                refs
            }
            Self::Dispatch {
                truck_id, load_id, ..
            } => vec![
                EntityRef::Truck(truck_id.clone()),
                EntityRef::Load(load_id.clone()),
            ],
            Self::Wait { .. } | Self::Notify { .. } | Self::Escalate { .. } => vec![],
        }
    }

    /// Priority of the load moved by this action, if it moves one.
    pub fn load_priority(&self) -> Option<LoadPriority> {
        match self {
            Self::Reassign { load_priority, .. } | Self::Dispatch { load_priority, .. } => {
                Some(*load_priority)
            }
            _ => None,
        }
    }
}

/// A candidate course of action with its estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Stable id of the form `SCEN-<issue>-<KIND>`.
    pub id: String,
    pub issue_id: String,
    pub name: String,
    pub description: String,
    /// The first action is the one executed; the rest are follow-ups.
    pub actions: Vec<Action>,
    pub estimated_cost: f64,
    pub estimated_time_min: f64,
    pub estimated_fuel_l: f64,
    pub reliability: f64,
    #[serde(default)]
    pub feasibility_violated: bool,
    /// Position within the issue's menu.
    pub sequence: usize,
}

impl Scenario {
    pub fn primary_action(&self) -> Option<&Action> {
        self.actions.first()
    }

    pub fn action_type(&self) -> Option<ActionType> {
        self.primary_action().map(Action::action_type)
    }

    /// Estimates are finite and non-negative, reliability within [0, 1].
    pub fn estimates_valid(&self) -> bool {
        let estimates = [
            self.estimated_cost,
            self.estimated_time_min,
            self.estimated_fuel_l,
        ];
        estimates.iter().all(|v| v.is_finite() && *v >= 0.0)
            && (0.0..=1.0).contains(&self.reliability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassign_touches_both_trucks_and_load() {
        let action = Action::Reassign {
            load_id: "L1".into(),
            from_truck_id: Some("T1".into()),
            to_truck_id: "T2".into(),
            load_priority: LoadPriority::High,
        };
        let touched = action.touched_entities();
        assert_eq!(touched.len(), 3);
        assert!(touched.contains(&EntityRef::Truck("T1".into())));
        assert!(touched.contains(&EntityRef::Truck("T2".into())));
        assert!(touched.contains(&EntityRef::Load("L1".into())));
    }

    #[test]
    fn test_non_mutating_actions_touch_nothing() {
        let wait = Action::Wait {
            truck_id: Some("T1".into()),
            duration_minutes: 30.0,
        };
        assert!(wait.touched_entities().is_empty());
        assert!(!wait.action_type().mutates_fleet());
    }

    #[test]
    fn test_action_serializes_with_type_tag() {
        let action = Action::Escalate {
            reason: "no trucks".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "escalate");
        assert_eq!(json["reason"], "no trucks");
    }
}
