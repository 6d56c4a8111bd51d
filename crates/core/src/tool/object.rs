use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument;

use super::{Error, Tool, ToolOutcome};

pub(crate) trait ToolObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameter_schema(&self) -> &Value;

    fn execute(
        self: Arc<Self>,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = ToolOutcome> + Send>>;
}

pub(crate) struct ToolObjectImpl<T: Tool>(pub T);

impl<T: Tool> ToolObject for ToolObjectImpl<T> {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }

    #[inline]
    fn description(&self) -> &str {
        self.0.description()
    }

    #[inline]
    fn parameter_schema(&self) -> &Value {
        self.0.parameter_schema()
    }

    fn execute(
        self: Arc<Self>,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = ToolOutcome> + Send>> {
        let input: T::Input = match serde_json::from_value(arguments) {
            Ok(input) => input,
            Err(err) => {
                let reason = format!("{err}");
                return Box::pin(std::future::ready(ToolOutcome::Err(
                    Error::invalid_input().with_reason(reason),
                )));
            }
        };

        let span = debug_span!("tool execute", tool = self.0.name());
        Box::pin(self.0.execute(input).instrument(span))
    }
}
