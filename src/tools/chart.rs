use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::aggregator::NativeTool;

/// Appended to the system prompt when the chart tool is enabled.
pub const CHART_INSTRUCTION: &str = "When you call generateChart, the chart is rendered for the user \
directly from the arguments you pass. Treat the tool result as final: do not describe, repeat or \
reason about the chart data afterwards.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Bar,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Dataset {
    pub label: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
    #[schemars(description = "Chart title")]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChartArgs {
    #[serde(rename = "type")]
    #[schemars(description = "Chart type")]
    pub kind: ChartKind,
    pub data: ChartData,
}

/// Validates chart arguments and hands them straight back; the client renders them.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenerateChart;

#[async_trait]
impl NativeTool for GenerateChart {
    fn name(&self) -> &str {
        "generateChart"
    }

    fn description(&self) -> &str {
        "Render a line or bar chart for the user from labels and datasets."
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(ChartArgs)
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let chart: ChartArgs = serde_json::from_value(args)?;
        Ok(serde_json::to_value(chart)?)
    }
}
