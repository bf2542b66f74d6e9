use chrono::{FixedOffset, Utc};
use serde::Deserialize;

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::Tool;

/// Reports the current time, optionally shifted to a UTC offset.
pub struct CurrentTimeTool;

#[derive(Deserialize, Default)]
struct CurrentTimeInput {
    #[serde(default)]
    utc_offset_hours: Option<i32>,
}

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time (RFC 3339). Optionally pass utc_offset_hours."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "integer",
                    "description": "Offset from UTC in hours, e.g. 9 for JST (default: 0)"
                }
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        let params: CurrentTimeInput = if args.is_null() {
            CurrentTimeInput::default()
        } else {
            serde_json::from_value(args).map_err(|e| StepGraphError::ToolValidation(e.to_string()))?
        };

        let hours = params.utc_offset_hours.unwrap_or(0);
        let offset = FixedOffset::east_opt(hours * 3600).ok_or_else(|| {
            StepGraphError::ToolValidation(format!("utc_offset_hours out of range: {}", hours))
        })?;

        let now = Utc::now().with_timezone(&offset);
        Ok(serde_json::json!({
            "now": now.to_rfc3339(),
            "utc_offset_hours": hours,
        }))
    }
}
