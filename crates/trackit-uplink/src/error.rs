use crate::courier::Transport;

/// A rejected dispatcher control operation. State is unchanged when returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("cannot start {requested}: {active} sending is active")]
    Exclusive { requested: Transport, active: Transport },
    #[error("no {0} destinations configured")]
    NoDestinations(Transport),
    #[error("send interval must be non-zero")]
    ZeroInterval,
}
