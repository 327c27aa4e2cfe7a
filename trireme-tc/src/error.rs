use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TcError {
    #[error("queue count {0} exceeds the maximum of 255")]
    TooManyQueues(u16),

    #[error("cgroup high bit {0} exceeds the maximum of 15")]
    CgroupHighBitOutOfRange(u8),

    #[error("cgroup start mark {mark} + queue count {queues} + 1 overflows a 16-bit mark space")]
    MarkSpaceOverflow { mark: u32, queues: u32 },

    #[error("device name {0:?} is longer than IFNAMSIZ - 1 (15 bytes)")]
    DeviceNameTooLong(String),

    #[error("tc exited with status {status}: {command}")]
    CommandFailed { command: String, status: i32 },

    #[error("failed to spawn tc: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, TcError>;
