use anyhow::Result;
use std::sync::Arc;

use crate::events::Fields;
use crate::logging::ts_now;
use crate::stream::EventLog;

pub const CANCEL_RISK_INCREASING: &str = "CANCEL_RISK_INCREASING";

/// Out-of-band instructions to the execution layer. Not intents.
pub trait ExecutionSignals: Send {
    fn cancel_risk_increasing_orders(&self, reason: &str, gross_pct: f64) -> Result<()>;
}

/// Publishes control signals to a topic the execution service consumes.
pub struct StreamCancelSignal {
    log: Arc<dyn EventLog>,
    topic: String,
}

impl StreamCancelSignal {
    pub fn new(log: Arc<dyn EventLog>, topic: &str) -> Self {
        Self {
            log,
            topic: topic.to_string(),
        }
    }
}

impl ExecutionSignals for StreamCancelSignal {
    fn cancel_risk_increasing_orders(&self, reason: &str, gross_pct: f64) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("signal".into(), CANCEL_RISK_INCREASING.to_string());
        fields.insert("reason".into(), reason.to_string());
        fields.insert("gross_exposure_pct".into(), gross_pct.to_string());
        fields.insert("emitted_at".into(), ts_now());
        self.log.publish(&self.topic, &fields)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryEventLog;

    #[test]
    fn test_cancel_signal_published() {
        let log = Arc::new(MemoryEventLog::new());
        let signals = StreamCancelSignal::new(log.clone(), "execution_control");
        signals.cancel_risk_increasing_orders("cap_breach", 132.0).unwrap();

        let msgs = log.messages("execution_control");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data["signal"], CANCEL_RISK_INCREASING);
        assert_eq!(msgs[0].data["gross_exposure_pct"], "132");
    }
}
