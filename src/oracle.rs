//! Oracle query capability and the sample oracles used by the service.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use quote_oracle_types::{Amount, NatValue};
use rand::Rng;
use serde_json::{json, Value};

use crate::error::OracleError;

/// An oracle's answer to one query.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub reply: Value,
    /// Fee the oracle charged, if any.
    pub required_fee: Option<Amount>,
}

impl OracleReply {
    pub fn free(reply: Value) -> Self {
        Self {
            reply,
            required_fee: None,
        }
    }
}

/// A queryable data source.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn on_query(&self, query: &Value, fee: Option<&Amount>) -> Result<OracleReply, OracleError>;
}

/// Receiver for oracles that push results instead of being polled.
pub trait ReplyObserver: Send + Sync {
    fn on_reply(&self, reply: &Value);
    fn on_error(&self, error: &OracleError);
}

/// Read a positive sample out of a reply. Accepts integers, floats
/// (floored) and numeric strings.
pub fn parse_sample(reply: &Value) -> Option<NatValue> {
    let value = match reply {
        Value::Number(number) => match number.as_u64() {
            Some(int) => NatValue::from(int),
            None => float_sample(number.as_f64()?)?,
        },
        Value::String(text) => {
            let text = text.trim();
            match text.parse::<NatValue>() {
                Ok(int) => int,
                Err(_) => float_sample(text.parse::<f64>().ok()?)?,
            }
        }
        _ => return None,
    };
    (value > 0).then_some(value)
}

fn float_sample(value: f64) -> Option<NatValue> {
    if !value.is_finite() || value < 0.0 || value >= NatValue::MAX as f64 {
        return None;
    }
    Some(value.floor() as NatValue)
}

/// Answers its n-th query with `start + step * n`.
#[derive(Debug)]
pub struct ScriptedOracle {
    start: Mutex<NatValue>,
    step: NatValue,
    queries: AtomicU64,
}

impl ScriptedOracle {
    pub fn new(start: NatValue, step: NatValue) -> Self {
        Self {
            start: Mutex::new(start),
            step,
            queries: AtomicU64::new(0),
        }
    }

    /// Restart the sequence so the next query answers `value`.
    pub fn set(&self, value: NatValue) {
        let queries = NatValue::from(self.queries.load(Ordering::SeqCst));
        *self.start.lock() = value.saturating_sub(self.step.saturating_mul(queries));
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn on_query(&self, _query: &Value, _fee: Option<&Amount>) -> Result<OracleReply, OracleError> {
        let n = NatValue::from(self.queries.fetch_add(1, Ordering::SeqCst));
        let start = *self.start.lock();
        let value = self
            .step
            .checked_mul(n)
            .and_then(|offset| start.checked_add(offset))
            .ok_or_else(|| OracleError::Query("sample overflow".to_string()))?;
        let value = u64::try_from(value).map_err(|e| OracleError::Query(e.to_string()))?;
        Ok(OracleReply::free(json!(value)))
    }
}

/// Random walk around a starting price, for running the service without a
/// real feed.
#[derive(Debug)]
pub struct SimulatedOracle {
    price: Mutex<f64>,
    volatility: f64,
    failure_rate: f64,
}

impl SimulatedOracle {
    /// `volatility` is the largest relative move per query; `failure_rate`
    /// the chance a query errors.
    pub fn new(start: f64, volatility: f64, failure_rate: f64) -> Self {
        Self {
            price: Mutex::new(start),
            volatility,
            failure_rate,
        }
    }
}

#[async_trait]
impl Oracle for SimulatedOracle {
    async fn on_query(&self, _query: &Value, _fee: Option<&Amount>) -> Result<OracleReply, OracleError> {
        let mut rng = rand::thread_rng();
        if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate.min(1.0)) {
            return Err(OracleError::Unavailable);
        }
        let mut price = self.price.lock();
        let change = if self.volatility > 0.0 {
            rng.gen_range(-self.volatility..=self.volatility)
        } else {
            0.0
        };
        *price = (*price * (1.0 + change)).max(1.0);
        Ok(OracleReply::free(json!(*price)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_formats() {
        assert_eq!(parse_sample(&json!(1020)), Some(1020));
        assert_eq!(parse_sample(&json!(10.9)), Some(10));
        assert_eq!(parse_sample(&json!("974")), Some(974));
        assert_eq!(parse_sample(&json!(" 12.5 ")), Some(12));
    }

    #[test]
    fn test_parse_sample_rejects_invalid() {
        assert_eq!(parse_sample(&json!(0)), None);
        assert_eq!(parse_sample(&json!(-3)), None);
        assert_eq!(parse_sample(&json!(0.4)), None);
        assert_eq!(parse_sample(&json!("NaN")), None);
        assert_eq!(parse_sample(&json!("abc")), None);
        assert_eq!(parse_sample(&json!(null)), None);
        assert_eq!(parse_sample(&json!({"price": 3})), None);
    }

    #[tokio::test]
    async fn test_scripted_oracle_sequence() {
        let oracle = ScriptedOracle::new(1000, 10);
        let query = json!({});
        assert_eq!(oracle.on_query(&query, None).await.unwrap().reply, json!(1000));
        assert_eq!(oracle.on_query(&query, None).await.unwrap().reply, json!(1010));

        oracle.set(500);
        assert_eq!(oracle.on_query(&query, None).await.unwrap().reply, json!(500));
        assert_eq!(oracle.on_query(&query, None).await.unwrap().reply, json!(510));
        assert_eq!(oracle.queries(), 4);
    }

    #[tokio::test]
    async fn test_simulated_oracle_stays_positive() {
        let oracle = SimulatedOracle::new(100.0, 0.05, 0.0);
        for _ in 0..50 {
            let reply = oracle.on_query(&json!({}), None).await.unwrap();
            assert!(parse_sample(&reply.reply).is_some());
        }
    }
}
