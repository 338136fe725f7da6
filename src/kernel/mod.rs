//! The task/memory kernel: arena pools, the task table and scheduler,
//! syscall dispatch, and the relocating loader.
//!
//! The kernel context is built once at boot and passed explicitly down
//! the call graph; nothing here is process-global. The two arena pools
//! sit behind independent locks; the task table is mutated only inside
//! the scheduler's critical section, and an arena lock is never taken
//! while that critical section is held.

use spin::Mutex;

pub mod arena;
pub use arena::{Arena, ArenaStats, Block};

pub mod task;
pub use task::{MemLayout, Task, TaskSnapshot, TaskState, MAX_TASKS};

pub mod platform;
pub use platform::{NullPlatform, Platform};

mod sched;

pub mod syscall;

mod loader;
pub use loader::load_and_start;

/// Open-file capacity of the kernel's descriptor table.
pub const MAX_FILES: usize = 16;

/// Pool geometry for one kernel instance.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub kernel_base: u32,
    pub kernel_size: u32,
    pub user_base: u32,
    pub user_size: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        // The RP2040 memory map: SRAM at 0x2000_0000, kernel pool first.
        KernelConfig {
            kernel_base: 0x2000_0000,
            kernel_size: 64 * 1024,
            user_base: 0x2001_0000,
            user_size: 128 * 1024,
        }
    }
}

/// The kernel context.
pub struct Kernel<P> {
    pub platform: P,
    kernel_arena: Mutex<Arena>,
    user_arena: Mutex<Arena>,
    tasks: Vec<Task>,
    current: usize,
    task_count: u32,
    preempt_pending: bool,
    files: Vec<Option<crate::fs::FileHandle>>,
    syscalls_handled: u32,
    context_switches: u32,
}

/// Free and used bytes plus the block map of one pool.
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub stats: ArenaStats,
    pub blocks: Vec<Block>,
}

/// `list_memory` output.
#[derive(Debug, Clone)]
pub struct MemoryReport {
    pub kernel: PoolReport,
    pub user: PoolReport,
}

impl<P: Platform> Kernel<P> {
    /// Boot a kernel: both pools empty, slot 0 running as the idle task.
    pub fn new(config: KernelConfig, platform: P) -> Self {
        let mut tasks: Vec<Task> = (0..MAX_TASKS as u8).map(Task::empty).collect();
        tasks[0].state = TaskState::Running;
        tasks[0].priority = task::IDLE_PRIORITY;
        tasks[0].name = crate::mimi::name_bytes("idle");
        Kernel {
            platform,
            kernel_arena: Mutex::new(Arena::new(config.kernel_base, config.kernel_size)),
            user_arena: Mutex::new(Arena::new(config.user_base, config.user_size)),
            tasks,
            current: 0,
            task_count: 1,
            preempt_pending: false,
            files: (0..MAX_FILES).map(|_| None).collect(),
            syscalls_handled: 0,
            context_switches: 0,
        }
    }

    /// Index of the running task.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Whether a voluntary reschedule was requested; the platform's
    /// pend-switch hook polls this.
    pub fn preempt_pending(&self) -> bool {
        self.preempt_pending
    }

    pub fn task(&self, id: usize) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    pub fn syscalls_handled(&self) -> u32 {
        self.syscalls_handled
    }

    pub fn context_switches(&self) -> u32 {
        self.context_switches
    }

    /// Allocate user memory on behalf of a task.
    pub fn user_alloc(&self, owner: u8, size: u32) -> Option<u32> {
        self.user_arena.lock().alloc(owner, size)
    }

    /// Allocate kernel-owned memory.
    pub fn kernel_alloc(&self, size: u32) -> Option<u32> {
        self.kernel_arena.lock().alloc(arena::KERNEL_OWNER, size)
    }

    pub fn kernel_free(&self, addr: u32) -> bool {
        self.kernel_arena.lock().free(addr)
    }

    /// Run `f` with the user pool locked.
    pub fn with_user_arena<T>(&self, f: impl FnOnce(&mut Arena) -> T) -> T {
        f(&mut self.user_arena.lock())
    }

    /// Run `f` with the kernel pool locked.
    pub fn with_kernel_arena<T>(&self, f: impl FnOnce(&mut Arena) -> T) -> T {
        f(&mut self.kernel_arena.lock())
    }

    /// Snapshot both pools.
    pub fn list_memory(&self) -> MemoryReport {
        let kernel = {
            let pool = self.kernel_arena.lock();
            PoolReport {
                stats: pool.stats(),
                blocks: pool.blocks().to_vec(),
            }
        };
        let user = {
            let pool = self.user_arena.lock();
            PoolReport {
                stats: pool.stats(),
                blocks: pool.blocks().to_vec(),
            }
        };
        MemoryReport { kernel, user }
    }

    /// Snapshot the task table, skipping free slots.
    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .filter(|task| task.state != TaskState::Free)
            .map(|task| TaskSnapshot {
                id: task.id,
                name: String::from_utf8_lossy(task.name_str()).into_owned(),
                state: task.state,
                priority: task.priority,
                cpu_ticks: task.cpu_ticks,
                total_size: task.layout.total_size,
            })
            .collect()
    }

}
