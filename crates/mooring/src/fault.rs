//! Process-wide reporting for errors raised on background threads.
//!
//! Accept loops, worker tasks and completion listeners run with no caller to
//! unwind to, so their failures are delivered to a process-wide sink instead.
//! The sink is an explicit injectable: install your own with [`set_sink`],
//! otherwise faults are logged via `tracing` at ERROR level.

use once_cell::sync::Lazy;
use std::any::Any;
use std::fmt::{self, Display};
use std::sync::{Arc, RwLock};
use tracing::{event, Level};

/// A failure reported from a background thread: where it happened and what
/// the failure rendered as.
#[derive(Debug, Clone)]
pub struct Fault {
    context: &'static str,
    message: String,
}

impl Fault {
    pub fn new(context: &'static str, error: &dyn Display) -> Self {
        Self {
            context,
            message: error.to_string(),
        }
    }

    /// Builds a fault from a caught panic payload. Payloads that are not
    /// strings render as an opaque marker.
    pub fn from_panic(context: &'static str, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };

        Self { context, message }
    }

    pub fn context(&self) -> &'static str {
        self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

/// Receives faults raised on background threads.
pub trait FaultSink: Send + Sync {
    fn report(&self, fault: Fault);
}

/// Default sink: emits the fault to the tracing infrastructure.
struct TracingSink;

impl FaultSink for TracingSink {
    fn report(&self, fault: Fault) {
        event!(
            Level::ERROR,
            message = "unhandled background fault",
            context = fault.context(),
            error = fault.message()
        );
    }
}

static SINK: Lazy<RwLock<Arc<dyn FaultSink>>> =
    Lazy::new(|| RwLock::new(Arc::new(TracingSink)));

/// Replaces the process-wide fault sink. Reports racing with the swap may be
/// delivered to either sink.
pub fn set_sink(sink: Arc<dyn FaultSink>) {
    *SINK.write().expect("fault sink lock poisoned") = sink;
}

/// Delivers a fault to the installed sink.
pub fn report(fault: Fault) {
    let sink = Arc::clone(&*SINK.read().expect("fault sink lock poisoned"));
    sink.report(fault);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reaches_installed_sink() {
        let sink = testing::recording();

        report(Fault::new("unit test", &"fault-sink-marker-1"));

        assert!(sink.contains("fault-sink-marker-1"));
    }

    #[test]
    fn panic_payload_renders_string_content() {
        let payload: Box<dyn Any + Send> = Box::new("boom in listener".to_string());
        let fault = Fault::from_panic("listener", payload.as_ref());

        assert_eq!(fault.message(), "boom in listener");
        assert_eq!(fault.context(), "listener");
    }

    #[test]
    fn opaque_panic_payload_still_renders() {
        let payload: Box<dyn Any + Send> = Box::new(17_u32);
        let fault = Fault::from_panic("listener", payload.as_ref());

        assert!(fault.message().contains("non-string"));
    }
}
