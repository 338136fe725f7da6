//! Task control blocks.

use crate::mimi;

/// Task-table capacity. Slot 0 is the idle/kernel task.
pub const MAX_TASKS: usize = 8;

/// Priority of the idle task; numerically the lowest possible.
pub const IDLE_PRIORITY: u8 = 255;

/// The task state machine.
///
/// `Free` slots hold no task. A loading task is `Blocked` until its
/// image is relocated, `Ready` once entry and stack are set, and cycles
/// `Ready`/`Running`/`Sleeping` under the scheduler. `Zombie` is
/// transient within teardown: the arena is reclaimed and the slot
/// returns to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Free,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
}

/// Section and region offsets of a loaded task, relative to the task's
/// arena block base.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemLayout {
    pub text_start: u32,
    pub text_size: u32,
    pub rodata_start: u32,
    pub rodata_size: u32,
    pub data_start: u32,
    pub data_size: u32,
    pub bss_start: u32,
    pub bss_size: u32,
    pub heap_start: u32,
    pub heap_size: u32,
    pub heap_used: u32,
    /// Offset just past the stack; the stack grows down from here.
    pub stack_top: u32,
    pub stack_size: u32,
    /// Whole block, 32-byte aligned.
    pub total_size: u32,
}

/// The register set preserved across a context switch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegs {
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub psr: u32,
}

/// One task control block.
#[derive(Debug)]
pub struct Task {
    pub id: u8,
    pub name: [u8; mimi::NAME_LEN],
    pub state: TaskState,
    pub priority: u8,
    /// Absolute entry address.
    pub entry: u32,
    /// Arena block base, or 0 when no memory is attached.
    pub base: u32,
    pub layout: MemLayout,
    /// Absolute wake deadline while `Sleeping`.
    pub wake_time: u32,
    pub cpu_ticks: u32,
    pub switches: u32,
    pub exit_code: i32,
    pub saved: SavedRegs,
}

impl Task {
    pub fn empty(id: u8) -> Task {
        Task {
            id,
            name: [0; mimi::NAME_LEN],
            state: TaskState::Free,
            priority: IDLE_PRIORITY,
            entry: 0,
            base: 0,
            layout: MemLayout::default(),
            wake_time: 0,
            cpu_ticks: 0,
            switches: 0,
            exit_code: 0,
            saved: SavedRegs::default(),
        }
    }

    /// Return the slot to its boot state.
    pub fn reset(&mut self) {
        *self = Task::empty(self.id);
    }

    /// Candidate for the scheduler's pick.
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    pub fn name_str(&self) -> &[u8] {
        mimi::name_str(&self.name)
    }
}

/// A row of `list_tasks` output.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: u8,
    pub name: String,
    pub state: TaskState,
    pub priority: u8,
    pub cpu_ticks: u32,
    pub total_size: u32,
}
