use crate::error::{Result, TcError};
use crate::model::{Class, Filter, FilterSelector, Matcher, MetaMatch, Parent, Qdisc, QdiscKind, Record, U32Match};

const ROOT_HANDLE: u32 = 1;
const NF_MARK_MASK: u8 = 0xff;
const NF_MARK_VALUE: u8 = 0x64;
const IP_VERSION_OFFSET: u8 = 0;
const IP_VERSION_MASK: u8 = 0xf0;
const IPV4_VERSION_NIBBLE: u8 = 0x40;
const CLASS_RATE_MBIT: u32 = 100_000;
const MAX_DEVICE_NAME_LEN: usize = 15;

/// Parameters identifying one interface's classifier setup: the device,
/// how many per-CPU queues it has, the high bit reserved for cgroup marks,
/// and the first mark value assigned to a cgroup-tagged socket.
#[derive(Debug, Clone)]
pub struct ClassifierParams {
    pub device: String,
    pub num_queues: u16,
    pub cgroup_high_bit: u8,
    pub cgroup_start_mark: u32,
}

impl ClassifierParams {
    fn validate(&self) -> Result<()> {
        if self.num_queues > 255 {
            return Err(TcError::TooManyQueues(self.num_queues));
        }
        if self.cgroup_high_bit > 15 {
            return Err(TcError::CgroupHighBitOutOfRange(self.cgroup_high_bit));
        }
        if self.device.len() > MAX_DEVICE_NAME_LEN {
            return Err(TcError::DeviceNameTooLong(self.device.clone()));
        }
        let overflow_check = self.cgroup_start_mark + self.num_queues as u32 + 1;
        if overflow_check >= 65536 {
            return Err(TcError::MarkSpaceOverflow { mark: self.cgroup_start_mark, queues: self.num_queues as u32 });
        }
        Ok(())
    }
}

/// A fully built, ordered classifier program. Lines are emitted in
/// installation order (qdisc before the classes/filters that reference it).
#[derive(Debug, Clone, Default)]
pub struct ClassifierProgram {
    records: Vec<Record>,
}

impl ClassifierProgram {
    /// Ingress-to-host program: one root `htb` qdisc, and N+1 filters on it
    /// matching the socket-cgroup mark the kernel stamped on the packet,
    /// steering queue `i` to mark `0x64` for `i` in `[0, N]`.
    pub fn build_input(params: &ClassifierParams) -> Result<Self> {
        params.validate()?;
        let mut records = Vec::with_capacity(1 + params.num_queues as usize + 1);
        records.push(Record::Qdisc(Qdisc {
            device: params.device.clone(),
            parent: Parent::Root,
            handle: ROOT_HANDLE,
            kind: QdiscKind::Htb,
        }));
        for i in 0..=params.num_queues {
            records.push(Record::Filter(Filter {
                device: params.device.clone(),
                parent_handle: ROOT_HANDLE,
                selector: FilterSelector::Priority(i as u32 + 1),
                matcher: Matcher::Meta(MetaMatch { field: "nf_mark", mask: NF_MARK_MASK, value: NF_MARK_VALUE }),
                queue: i,
            }));
        }
        Ok(ClassifierProgram { records })
    }

    /// Host-to-wire program: one root `htb` qdisc, a cgroup filter at the
    /// root steering unmatched traffic to queue 0, and `N` (class, child
    /// qdisc, filter) triples, one per non-zero queue.
    ///
    /// Queue numbers for the per-class records run `1..=N` (queue 0 is the
    /// root's catch-all), with `class_id = M + queue` and `child handle =
    /// 10 * queue`.
    pub fn build_output(params: &ClassifierParams) -> Result<Self> {
        params.validate()?;
        let mut records = Vec::with_capacity(2 + params.num_queues as usize * 3);
        records.push(Record::Qdisc(Qdisc {
            device: params.device.clone(),
            parent: Parent::Root,
            handle: ROOT_HANDLE,
            kind: QdiscKind::Htb,
        }));
        records.push(Record::Filter(Filter {
            device: params.device.clone(),
            parent_handle: ROOT_HANDLE,
            selector: FilterSelector::Priority(1),
            matcher: Matcher::Cgroup,
            queue: 0,
        }));

        for queue in 1..=params.num_queues {
            let class_id = params.cgroup_start_mark + queue as u32;
            let child_handle = 10 * queue as u32;

            records.push(Record::Class(Class {
                device: params.device.clone(),
                parent_handle: ROOT_HANDLE,
                class_id,
                kind: QdiscKind::Htb,
                rate_mbit: CLASS_RATE_MBIT,
            }));
            records.push(Record::Qdisc(Qdisc {
                device: params.device.clone(),
                parent: Parent::Handle(class_id),
                handle: child_handle,
                kind: QdiscKind::Htb,
            }));
            records.push(Record::Filter(Filter {
                device: params.device.clone(),
                parent_handle: child_handle,
                selector: FilterSelector::Handle(child_handle),
                matcher: Matcher::U32(U32Match { offset: IP_VERSION_OFFSET, mask: IP_VERSION_MASK, value: IPV4_VERSION_NIBBLE }),
                queue,
            }));
        }

        Ok(ClassifierProgram { records })
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Total qdisc count: 1 for the input program (just the root), or
    /// `1 + N` for the output program (root plus one child qdisc per
    /// non-zero queue).
    pub fn qdisc_count(&self) -> usize {
        self.records.iter().filter(|r| matches!(r, Record::Qdisc(_))).count()
    }

    pub fn class_count(&self) -> usize {
        self.records.iter().filter(|r| matches!(r, Record::Class(_))).count()
    }

    pub fn root_filter_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, Record::Filter(flt) if flt.parent_handle == ROOT_HANDLE))
            .count()
    }

    pub fn to_command_lines(&self) -> Vec<String> {
        self.records.iter().map(|r| r.to_string()).collect()
    }

    /// The program rendered as `del` lines in reverse installation order,
    /// so children are torn down before their parents.
    pub fn to_teardown_lines(&self) -> Vec<String> {
        self.records.iter().rev().map(|r| r.as_delete()).collect()
    }
}
