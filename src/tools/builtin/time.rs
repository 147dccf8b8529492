//! Clock tool.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::context::JobContext;
use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// Largest accepted UTC offset, in minutes.
const MAX_OFFSET_MINUTES: i64 = 14 * 60;

/// Reports the current time, optionally shifted to a fixed UTC offset.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Pass offset_minutes to shift from UTC \
         (for example -300 for US Eastern standard time)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes (default: 0)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let offset = match params.get("offset_minutes") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "offset_minutes must be an integer".to_string(),
            })?,
        };
        if offset.abs() > MAX_OFFSET_MINUTES {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: format!("offset_minutes must be within ±{MAX_OFFSET_MINUTES}"),
            });
        }

        let now = Utc::now();
        let local = now + ChronoDuration::minutes(offset);
        Ok(ToolOutput::success(
            serde_json::json!({
                "utc": now.to_rfc3339(),
                "local": local.format("%Y-%m-%d %H:%M:%S").to_string(),
                "weekday": local.format("%A").to_string(),
                "offset_minutes": offset,
            }),
            start.elapsed(),
        ))
    }
}
