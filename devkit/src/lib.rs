/*!
# Skywatch DevKit - test doubles for the ingestion and alerting pipeline

- `MockBus`: in-memory `BusClient` that records publishes and subscriptions
- `ScriptedEvents`: `BusEvents` source driven from the test (ConnAck, messages, link drops)
- `TestHarness`: temp CSV file with append helpers, plus a recording alert sink
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBus, MockMessage, ScriptHandle, ScriptedEvents};
pub use test_utils::{init_test_logging, RecordingSink, TestHarness, WEATHER_HEADER};
