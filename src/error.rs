/// Reasons a queue disc refuses to become operational.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("queue disc cannot have classes (found {0})")]
    HasClasses(usize),

    #[error("queue disc cannot have internal queues (found {0})")]
    HasInternalQueues(usize),

    #[error("queue disc needs at least one packet filter")]
    NoPacketFilter,

    #[error("invalid configuration: {0} must not be zero")]
    Zero(&'static str),

    #[error("quantum not set and no device attached to take the MTU from")]
    NoDevice,
}
