use std::fmt;

/// Only `htb` is needed by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscKind {
    Htb,
}

impl fmt::Display for QdiscKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdiscKind::Htb => write!(f, "htb"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Root,
    Handle(u32),
}

impl fmt::Display for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Root => write!(f, "root"),
            Parent::Handle(h) => write!(f, "parent {h:x}:"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Qdisc {
    pub device: String,
    pub parent: Parent,
    pub handle: u32,
    pub kind: QdiscKind,
}

impl fmt::Display for Qdisc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qdisc add dev {} {} handle {:x}: {}", self.device, self.parent, self.handle, self.kind)
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub device: String,
    pub parent_handle: u32,
    pub class_id: u32,
    pub kind: QdiscKind,
    pub rate_mbit: u32,
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class add dev {} parent {:x}: classid {:x}:{:x} {} rate {}mbit",
            self.device, self.parent_handle, self.parent_handle, self.class_id, self.kind, self.rate_mbit
        )
    }
}

/// A `meta(nf_mark) eq value` match, used by the input program to steer on
/// the socket-cgroup mark the kernel stamped on the packet.
#[derive(Debug, Clone)]
pub struct MetaMatch {
    pub field: &'static str,
    pub mask: u8,
    pub value: u8,
}

impl fmt::Display for MetaMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Unquoted: lines are split into argv and exec'd directly (see
        // executor.rs), not passed through a shell, so no quoting is needed.
        write!(f, "basic match meta({}.mask&{:#x} eq {:#x})", self.field, self.mask, self.value)
    }
}

/// A `u32` match against a byte at a fixed offset, used by the output
/// program to split IPv4 from IPv6 on the version nibble.
#[derive(Debug, Clone)]
pub struct U32Match {
    pub offset: u8,
    pub mask: u8,
    pub value: u8,
}

impl fmt::Display for U32Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u32 match u8 {:#x} {:#x} at {}", self.value, self.mask, self.offset)
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Meta(MetaMatch),
    U32(U32Match),
    Cgroup,
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Meta(m) => write!(f, "{m}"),
            Matcher::U32(m) => write!(f, "{m}"),
            Matcher::Cgroup => write!(f, "cgroup"),
        }
    }
}

/// A filter's position selector: the grammar's `{prio N|handle H:}` is an
/// exclusive alternation, never both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSelector {
    Priority(u32),
    Handle(u32),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub device: String,
    pub parent_handle: u32,
    pub selector: FilterSelector,
    pub matcher: Matcher,
    pub queue: u16,
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter add dev {} parent {:x}: protocol ip", self.device, self.parent_handle)?;
        match self.selector {
            FilterSelector::Priority(p) => write!(f, " prio {p}")?,
            FilterSelector::Handle(h) => write!(f, " handle {h:x}:")?,
        }
        write!(f, " {} action skbedit queue_mapping {}", self.matcher, self.queue)
    }
}

/// One record of a classifier program, in installation order.
#[derive(Debug, Clone)]
pub enum Record {
    Qdisc(Qdisc),
    Class(Class),
    Filter(Filter),
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Qdisc(q) => write!(f, "{q}"),
            Record::Class(c) => write!(f, "{c}"),
            Record::Filter(flt) => write!(f, "{flt}"),
        }
    }
}

impl Record {
    /// The same record rendered as a `del` instead of an `add`, used to
    /// flush a previously installed program before replacing it.
    pub fn as_delete(&self) -> String {
        let added = self.to_string();
        added.replacen("add", "del", 1)
    }
}
