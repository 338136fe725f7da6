//! The priority scheduler.
//!
//! A "tick" is any call into [`Kernel::tick`]: the periodic timer, a
//! yield, a sleep, or an exit. Each tick wakes due sleepers, then picks
//! the runnable task with the numerically lowest priority. The pick
//! scans circularly starting just past the current task, so
//! equal-priority peers take turns instead of deferring to slot order.
//! Slot 0 is the idle task, always runnable, so a pick always exists.
//!
//! The task table and the pick-and-switch run inside a critical
//! section (interrupts masked on the target, a global lock on the
//! host). The arena locks are never taken while it is held; task
//! teardown reclaims memory between critical sections, not inside one.

use log::{debug, trace};

use crate::common::{ErrorCode, Result};
use crate::kernel::task::TaskState;
use crate::kernel::{Kernel, Platform};

impl<P: Platform> Kernel<P> {
    /// Claim a FREE task slot, reset to defaults. The slot starts
    /// `Blocked`; the loader makes it `Ready`.
    pub fn task_alloc(&mut self) -> Option<usize> {
        critical_section::with(|_| {
            let slot = self
                .tasks
                .iter()
                .position(|task| task.state == TaskState::Free)?;
            let task = &mut self.tasks[slot];
            task.reset();
            task.state = TaskState::Blocked;
            self.task_count += 1;
            Some(slot)
        })
    }

    /// One scheduler tick: wake due sleepers, then run the pick. Returns
    /// the newly running slot if a context switch happened.
    pub fn tick(&mut self) -> Option<usize> {
        let now = self.platform.now_ms();
        critical_section::with(|_| {
            for task in &mut self.tasks {
                if task.state == TaskState::Sleeping && now >= task.wake_time {
                    task.state = TaskState::Ready;
                    trace!("sched: task {} woke", task.id);
                }
            }
            self.preempt_pending = false;
            self.pick_and_switch()
        })
    }

    /// The pick: numerically lowest priority among runnable tasks,
    /// scanning from just past the current one. Runs with the
    /// scheduler's critical section held.
    fn pick_and_switch(&mut self) -> Option<usize> {
        let current = self.current;
        let count = self.tasks.len();
        let mut winner: Option<usize> = None;
        for step in 0..count {
            let index = (current + 1 + step) % count;
            let task = &self.tasks[index];
            if !task.is_runnable() {
                continue;
            }
            match winner {
                Some(best) if self.tasks[best].priority <= task.priority => {}
                _ => winner = Some(index),
            }
        }
        // Slot 0 is always runnable.
        let winner = winner.unwrap_or(0);
        if winner == current {
            self.tasks[current].cpu_ticks += 1;
            return None;
        }
        if self.tasks[current].state == TaskState::Running {
            self.tasks[current].state = TaskState::Ready;
        }
        let task = &mut self.tasks[winner];
        task.state = TaskState::Running;
        task.switches += 1;
        task.cpu_ticks += 1;
        self.current = winner;
        self.context_switches += 1;
        trace!("sched: switch to task {}", winner);
        Some(winner)
    }

    /// Put the current task to sleep for `ms` milliseconds. The idle
    /// task refuses.
    pub fn sleep(&mut self, ms: u32) {
        if self.current == 0 {
            return;
        }
        let wake = self.platform.now_ms().wrapping_add(ms);
        critical_section::with(|_| {
            let task = &mut self.tasks[self.current];
            task.state = TaskState::Sleeping;
            task.wake_time = wake;
            self.pick_and_switch();
        });
    }

    /// Give up the processor voluntarily.
    pub fn yield_now(&mut self) {
        self.preempt_pending = true;
        self.tick();
    }

    /// Terminate the current task.
    pub fn exit_current(&mut self, code: i32) {
        if self.current == 0 {
            return;
        }
        let id = self.current;
        critical_section::with(|_| self.tasks[id].exit_code = code);
        self.teardown(id);
        critical_section::with(|_| {
            self.pick_and_switch();
        });
    }

    /// Kill a task by id. Takes effect immediately from the kernel's
    /// point of view; the victim never runs again.
    pub fn kill(&mut self, id: usize) -> Result<()> {
        if id == 0 {
            return Err(ErrorCode::Perm);
        }
        let live = critical_section::with(|_| {
            matches!(self.tasks.get(id), Some(task) if task.state != TaskState::Free)
        });
        if !live {
            return Err(ErrorCode::Inval);
        }
        debug!("sched: kill task {}", id);
        self.teardown(id);
        if id == self.current {
            critical_section::with(|_| {
                self.pick_and_switch();
            });
        }
        Ok(())
    }

    /// Zombie, reclaim, free the slot. The arena locks are taken between
    /// the two critical sections, never inside either.
    pub(crate) fn teardown(&mut self, id: usize) {
        critical_section::with(|_| self.tasks[id].state = TaskState::Zombie);
        let owner = id as u8;
        {
            let mut arena = self.user_arena.lock();
            arena.free_all(owner);
            arena.coalesce();
        }
        critical_section::with(|_| {
            self.tasks[id].reset();
            self.task_count = self.task_count.saturating_sub(1);
        });
    }
}
