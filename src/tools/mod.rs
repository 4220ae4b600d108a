//! Built-in local tools, present in every namespace regardless of the registry.

pub mod chart;
pub mod math;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ChatConfig;
use crate::mcp::aggregator::NativeTool;

pub use chart::{CHART_INSTRUCTION, GenerateChart};
pub use math::{CalculateSum, IsGreaterThan};

/// The fixed built-in table for the given chat settings.
#[must_use]
pub fn builtin_tools(chat: &ChatConfig) -> Vec<Arc<dyn NativeTool>> {
    let mut tools: Vec<Arc<dyn NativeTool>> = vec![
        Arc::new(CalculateSum),
        Arc::new(IsGreaterThan::new(Duration::from_millis(
            chat.comparison_delay_ms,
        ))),
    ];
    if chat.chart_tool {
        tools.push(Arc::new(GenerateChart));
    }
    tools
}

/// System prompt for a turn, with the chart instruction when that tool is on.
#[must_use]
pub fn system_prompt(chat: &ChatConfig) -> Option<String> {
    let base = chat.system_prompt.trim();
    match (base.is_empty(), chat.chart_tool) {
        (true, false) => None,
        (true, true) => Some(CHART_INSTRUCTION.to_string()),
        (false, false) => Some(base.to_string()),
        (false, true) => Some(format!("{base}\n\n{CHART_INSTRUCTION}")),
    }
}
