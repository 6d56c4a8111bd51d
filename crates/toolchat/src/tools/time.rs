use std::future::ready;

use chrono::{SecondsFormat, Utc};
use chrono_tz::Tz;
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use toolchat_core::tool::{Tool, ToolOutcome};

/// Arguments of [`CurrentTimeTool`].
#[derive(Deserialize, JsonSchema)]
pub struct CurrentTimeParameters {
    #[serde(default = "default_timezone")]
    #[schemars(
        description = "IANA timezone name, e.g. \"Asia/Taipei\", \"UTC\" or \"America/New_York\". Defaults to \"UTC\"."
    )]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

/// Returns the current date and time in a timezone.
pub struct CurrentTimeTool {
    parameter_schema: Value,
}

impl CurrentTimeTool {
    /// Creates a new time tool.
    #[inline]
    pub fn new() -> Self {
        CurrentTimeTool {
            parameter_schema: schema_for!(CurrentTimeParameters).to_value(),
        }
    }
}

impl Default for CurrentTimeTool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for CurrentTimeTool {
    type Input = CurrentTimeParameters;

    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        r#"
Gets the current date and time for any timezone.
Use this tool when you need to know the current time or date for a specific city, country, or timezone.
Returns ISO 8601 with seconds and offset, e.g. "2023-07-25T14:30:00+08:00"."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: CurrentTimeParameters,
    ) -> impl Future<Output = ToolOutcome> + Send + 'static {
        ready(Ok(current_time(&input.timezone)))
    }
}

fn current_time(timezone: &str) -> String {
    let tz = timezone.trim().parse::<Tz>().unwrap_or_else(|_| {
        debug!("unknown timezone `{timezone}`, using UTC");
        Tz::UTC
    });
    Utc::now()
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}
