#![forbid(unsafe_code)]

use std::cell::RefCell;

use trireme_tc::{flush_then_install, ClassifierParams, ClassifierProgram, Executor, Record, Result};

fn params(device: &str, num_queues: u16, cgroup_high_bit: u8, cgroup_start_mark: u32) -> ClassifierParams {
    ClassifierParams { device: device.to_string(), num_queues, cgroup_high_bit, cgroup_start_mark }
}

#[test]
fn input_program_has_n_plus_one_filters_on_one_root_qdisc() {
    let p = params("tun0", 4, 1, 0x100);
    let program = ClassifierProgram::build_input(&p).unwrap();
    assert_eq!(program.qdisc_count(), 1);
    assert_eq!(program.class_count(), 0);
    assert_eq!(program.root_filter_count(), 5); // N + 1
}

/// Boundary scenario 5: dev="tun0", N=4, B=1, M=0x100.
#[test]
fn output_program_matches_boundary_scenario_five() {
    let p = params("tun0", 4, 1, 0x100);
    let program = ClassifierProgram::build_output(&p).unwrap();

    assert_eq!(program.qdisc_count(), 5); // root (1) + child handles {10,20,30,40}
    assert_eq!(program.class_count(), 4);
    assert_eq!(program.root_filter_count(), 1); // the cgroup catch-all

    let qdisc_handles: Vec<u32> = program
        .records()
        .iter()
        .filter_map(|r| match r {
            Record::Qdisc(q) => Some(q.handle),
            _ => None,
        })
        .collect();
    assert_eq!(qdisc_handles, vec![1, 10, 20, 30, 40]);

    let class_ids: Vec<u32> = program
        .records()
        .iter()
        .filter_map(|r| match r {
            Record::Class(c) => Some(c.class_id),
            _ => None,
        })
        .collect();
    assert_eq!(class_ids, vec![0x101, 0x102, 0x103, 0x104]);

    let child_filter_queues: Vec<u16> = program
        .records()
        .iter()
        .filter_map(|r| match r {
            Record::Filter(flt) if flt.parent_handle != 1 => Some(flt.queue),
            _ => None,
        })
        .collect();
    assert_eq!(child_filter_queues, vec![1, 2, 3, 4]);

    // The rendered `tc` grammar uses an exclusive `{prio N|handle H:}`
    // selector: a child filter carries a handle, never both a handle and a
    // priority on the same line.
    let lines = program.to_command_lines();
    let child_filter_line = lines.iter().find(|l| l.contains("parent a:")).unwrap();
    assert!(child_filter_line.contains("handle a:"));
    assert!(!child_filter_line.contains("prio"));

    let root_filter_line = lines.iter().find(|l| l.contains("cgroup")).unwrap();
    assert!(root_filter_line.contains("prio 1"));
    assert!(!root_filter_line.contains("handle"));
}

#[test]
fn teardown_reverses_installation_order_and_uses_del() {
    let p = params("tun0", 2, 0, 0x10);
    let program = ClassifierProgram::build_output(&p).unwrap();
    let install_lines = program.to_command_lines();
    let teardown_lines = program.to_teardown_lines();
    assert_eq!(install_lines.len(), teardown_lines.len());
    assert!(teardown_lines[0].starts_with("filter del"));
    assert!(install_lines[0].starts_with("qdisc add"));
}

struct RecordingExecutor {
    calls: RefCell<Vec<String>>,
}

impl Executor for RecordingExecutor {
    fn run(&self, argv: &[&str]) -> Result<()> {
        self.calls.borrow_mut().push(argv.join(" "));
        Ok(())
    }
}

#[test]
fn flush_then_install_tears_down_before_installing() {
    let p = params("tun0", 1, 0, 0x10);
    let old = ClassifierProgram::build_output(&p).unwrap();
    let new = ClassifierProgram::build_output(&p).unwrap();
    let executor = RecordingExecutor { calls: RefCell::new(Vec::new()) };

    flush_then_install(&executor, Some(&old), &new).unwrap();

    let calls = executor.calls.borrow();
    let first_del = calls.iter().position(|c| c.contains("del")).unwrap();
    let first_add = calls.iter().position(|c| c.contains("add")).unwrap();
    assert!(first_del < first_add);
}
