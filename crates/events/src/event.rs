/// A domain-agnostic chain event.
///
/// Events are:
/// - **immutable** (treat them as facts already final on chain)
/// - **versioned** (schema evolution of the decoded payload)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "lending.deposit").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;
}
