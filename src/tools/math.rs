use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::mcp::aggregator::NativeTool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SumArgs {
    #[schemars(description = "First number")]
    pub a: f64,
    #[schemars(description = "Second number")]
    pub b: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompareArgs {
    #[schemars(description = "Number to compare")]
    pub a: f64,
    #[schemars(description = "Number to compare against")]
    pub b: f64,
}

/// Whole results are reported as integers, so `2 + 3` reads back as `5`.
#[allow(clippy::float_cmp)]
fn number(v: f64) -> Value {
    // 2^53: past this, f64 no longer holds every integer.
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if v.fract() == 0.0 && v.abs() < MAX_EXACT {
        // Whole and below 2^53, so the cast neither truncates nor saturates.
        #[allow(clippy::cast_possible_truncation)]
        let whole = v as i64;
        json!(whole)
    } else {
        json!(v)
    }
}

/// `calculateSum {a, b} -> a + b`
#[derive(Debug, Default, Clone, Copy)]
pub struct CalculateSum;

#[async_trait]
impl NativeTool for CalculateSum {
    fn name(&self) -> &str {
        "calculateSum"
    }

    fn description(&self) -> &str {
        "Add two numbers together and return the sum."
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(SumArgs)
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let SumArgs { a, b } = serde_json::from_value(args)?;
        Ok(number(a + b))
    }
}

/// `isGreaterThan {a, b} -> a > b`, after a simulated wait.
#[derive(Debug, Clone, Copy)]
pub struct IsGreaterThan {
    delay: Duration,
}

impl IsGreaterThan {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for IsGreaterThan {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000))
    }
}

#[async_trait]
impl NativeTool for IsGreaterThan {
    fn name(&self) -> &str {
        "isGreaterThan"
    }

    fn description(&self) -> &str {
        "Check whether the first number is greater than the second. Takes a few seconds."
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(CompareArgs)
    }

    fn reports_progress(&self) -> bool {
        true
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let CompareArgs { a, b } = serde_json::from_value(args)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Value::Bool(a > b))
    }
}
