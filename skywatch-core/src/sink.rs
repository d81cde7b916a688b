use crate::error::SinkError;
use crate::models::AlertEvent;

/// Where fired alerts go. The core's only obligation is a fully formed event.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError>;
}

impl<S: AlertSink + ?Sized> AlertSink for Box<S> {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        (**self).emit(event)
    }
}

impl<S: AlertSink + ?Sized> AlertSink for std::sync::Arc<S> {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        (**self).emit(event)
    }
}
