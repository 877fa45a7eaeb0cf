//! In-process oracles: a rule-only stand-in and a scripted test double.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::ports::{OracleError, ReasoningOracle, Situation};

/// Oracle used when none is configured; it always declines so the
/// reasoning stage applies its rules straight away.
#[derive(Debug, Clone, Default)]
pub struct RuleOnlyOracle;

#[async_trait]
impl ReasoningOracle for RuleOnlyOracle {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn evaluate(
        &self,
        _situation: &Situation,
        _schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value, OracleError> {
        Err(OracleError::Rejected("no reasoning oracle configured".to_string()))
    }
}

/// Scripted oracle for tests.
///
/// Queued responses are consumed first; afterwards every call gets the
/// fallback response.
pub struct ScriptedOracle {
    queued: Mutex<VecDeque<Result<serde_json::Value, OracleError>>>,
    fallback: Result<serde_json::Value, OracleError>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
    last_situation: Mutex<Option<Situation>>,
}

impl ScriptedOracle {
    /// Answer every call with `response`.
    pub fn always(response: Result<serde_json::Value, OracleError>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: response,
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
            last_situation: Mutex::new(None),
        }
    }

    /// Answer with `responses` in order, then with `then`.
    pub fn sequence(
        responses: Vec<Result<serde_json::Value, OracleError>>,
        then: Result<serde_json::Value, OracleError>,
    ) -> Self {
        let oracle = Self::always(then);
        Self {
            queued: Mutex::new(responses.into()),
            ..oracle
        }
    }

    /// Sleep before answering, to exercise timeouts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of calls made so far.
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn last_situation(&self) -> Option<Situation> {
        self.last_situation.lock().await.clone()
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn evaluate(
        &self,
        situation: &Situation,
        _schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_situation.lock().await = Some(situation.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.queued.lock().await.pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::FleetSnapshot;
    use serde_json::json;

    fn situation() -> Situation {
        Situation::from_snapshot(&FleetSnapshot::default())
    }

    #[tokio::test]
    async fn test_rule_only_oracle_declines_permanently() {
        let err = RuleOnlyOracle.evaluate(&situation(), &json!({})).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_sequence_then_fallback() {
        let oracle = ScriptedOracle::sequence(
            vec![Err(OracleError::RateLimited), Ok(json!({"n": 1}))],
            Ok(json!({"n": 2})),
        );
        let s = situation();
        let hint = json!({});

        assert_eq!(oracle.evaluate(&s, &hint).await, Err(OracleError::RateLimited));
        assert_eq!(oracle.evaluate(&s, &hint).await, Ok(json!({"n": 1})));
        assert_eq!(oracle.evaluate(&s, &hint).await, Ok(json!({"n": 2})));
        assert_eq!(oracle.calls(), 3);
        assert!(oracle.last_situation().await.is_some());
    }
}
