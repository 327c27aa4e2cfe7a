#![forbid(unsafe_code)]

mod builder;
mod error;
mod executor;
mod model;

pub use builder::{ClassifierParams, ClassifierProgram};
pub use error::{Result, TcError};
pub use executor::{flush, flush_then_install, install, Executor, ShellExecutor};
pub use model::{Class, Filter, FilterSelector, Matcher, MetaMatch, Parent, Qdisc, QdiscKind, Record, U32Match};

#[cfg(test)]
mod tests {
    use super::*;

    fn params(device: &str, num_queues: u16, cgroup_high_bit: u8, cgroup_start_mark: u32) -> ClassifierParams {
        ClassifierParams { device: device.to_string(), num_queues, cgroup_high_bit, cgroup_start_mark }
    }

    #[test]
    fn rejects_too_many_queues() {
        let p = params("tun0", 256, 1, 0x100);
        assert!(matches!(ClassifierProgram::build_input(&p), Err(TcError::TooManyQueues(256))));
    }

    #[test]
    fn rejects_cgroup_high_bit_out_of_range() {
        let p = params("tun0", 4, 16, 0x100);
        assert!(matches!(ClassifierProgram::build_input(&p), Err(TcError::CgroupHighBitOutOfRange(16))));
    }

    #[test]
    fn rejects_mark_space_overflow_arithmetically_not_by_xor() {
        // 65535 + 4 + 1 overflows arithmetically; a buggy XOR-based guard
        // would not catch this combination.
        let p = params("tun0", 4, 1, 65535);
        assert!(matches!(ClassifierProgram::build_input(&p), Err(TcError::MarkSpaceOverflow { .. })));
    }

    #[test]
    fn rejects_overlong_device_name() {
        let p = params("a-device-name-too-long-for-ifnamsiz", 4, 1, 0x100);
        assert!(matches!(ClassifierProgram::build_input(&p), Err(TcError::DeviceNameTooLong(_))));
    }
}
