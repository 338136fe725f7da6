//! Syscall numbers, the name table, and the dispatcher.
//!
//! User programs reach the kernel with the number in `r7`, arguments in
//! `r0`-`r3`, and `SVC #0`; the exception handler hands those four words
//! to [`Kernel::dispatch`]. The name table is shared with the compiler,
//! which lowers calls to these names into `MOV r7, #n; SVC #0` directly,
//! and with the linker and loader, which resolve leftover extern symbols
//! against it.
//!
//! Buffer arguments are task-space addresses; the dispatcher translates
//! them through the user arena before touching them.

use log::trace;

use crate::common::ErrorCode;
use crate::fs::{BlockDevice, OpenMode, Volume};
use crate::kernel::{Kernel, Platform, MAX_FILES};

/// The stable syscall number contract.
pub mod nr {
    pub const EXIT: u32 = 0;
    pub const YIELD: u32 = 1;
    pub const SLEEP: u32 = 2;
    pub const TIME: u32 = 3;

    pub const MALLOC: u32 = 10;
    pub const FREE: u32 = 11;
    pub const REALLOC: u32 = 12;

    pub const OPEN: u32 = 20;
    pub const CLOSE: u32 = 21;
    pub const READ: u32 = 22;
    pub const WRITE: u32 = 23;
    pub const SEEK: u32 = 24;

    pub const PUTCHAR: u32 = 30;
    pub const GETCHAR: u32 = 31;
    pub const PUTS: u32 = 32;

    pub const GPIO_INIT: u32 = 40;
    pub const GPIO_DIR: u32 = 41;
    pub const GPIO_PUT: u32 = 42;
    pub const GPIO_GET: u32 = 43;
    pub const GPIO_PULL: u32 = 44;

    pub const PWM_INIT: u32 = 50;
    pub const PWM_SET_WRAP: u32 = 51;
    pub const PWM_SET_LEVEL: u32 = 52;
    pub const PWM_ENABLE: u32 = 53;

    pub const ADC_INIT: u32 = 60;
    pub const ADC_SELECT: u32 = 61;
    pub const ADC_READ: u32 = 62;
    pub const ADC_TEMP: u32 = 63;

    pub const SPI_INIT: u32 = 70;
    pub const SPI_WRITE: u32 = 71;
    pub const SPI_READ: u32 = 72;
    pub const SPI_TRANSFER: u32 = 73;

    pub const I2C_INIT: u32 = 80;
    pub const I2C_WRITE: u32 = 81;
    pub const I2C_READ: u32 = 82;
}

/// C-visible names and their syscall numbers. The compiler, linker, and
/// loader all resolve against this table.
pub const SYSCALL_NAMES: &[(&str, u8)] = &[
    ("exit", nr::EXIT as u8),
    ("yield", nr::YIELD as u8),
    ("sleep_ms", nr::SLEEP as u8),
    ("time_ms", nr::TIME as u8),
    ("malloc", nr::MALLOC as u8),
    ("free", nr::FREE as u8),
    ("realloc", nr::REALLOC as u8),
    ("open", nr::OPEN as u8),
    ("close", nr::CLOSE as u8),
    ("read", nr::READ as u8),
    ("write", nr::WRITE as u8),
    ("lseek", nr::SEEK as u8),
    ("putchar", nr::PUTCHAR as u8),
    ("getchar", nr::GETCHAR as u8),
    ("puts", nr::PUTS as u8),
    ("gpio_init", nr::GPIO_INIT as u8),
    ("gpio_set_dir", nr::GPIO_DIR as u8),
    ("gpio_put", nr::GPIO_PUT as u8),
    ("gpio_get", nr::GPIO_GET as u8),
    ("gpio_pull", nr::GPIO_PULL as u8),
    ("pwm_init", nr::PWM_INIT as u8),
    ("pwm_set_wrap", nr::PWM_SET_WRAP as u8),
    ("pwm_set_level", nr::PWM_SET_LEVEL as u8),
    ("pwm_enable", nr::PWM_ENABLE as u8),
    ("adc_init", nr::ADC_INIT as u8),
    ("adc_select", nr::ADC_SELECT as u8),
    ("adc_read", nr::ADC_READ as u8),
    ("adc_temp", nr::ADC_TEMP as u8),
    ("spi_init", nr::SPI_INIT as u8),
    ("spi_write", nr::SPI_WRITE as u8),
    ("spi_read", nr::SPI_READ as u8),
    ("spi_transfer", nr::SPI_TRANSFER as u8),
    ("i2c_init", nr::I2C_INIT as u8),
    ("i2c_write", nr::I2C_WRITE as u8),
    ("i2c_read", nr::I2C_READ as u8),
];

/// Look up a function name in the syscall table.
pub fn syscall_by_name(name: &[u8]) -> Option<u8> {
    SYSCALL_NAMES
        .iter()
        .find(|(entry, _)| entry.as_bytes() == name)
        .map(|&(_, number)| number)
}

/// File open mode bits as seen by user programs.
const O_READ: u32 = 1;
const O_WRITE: u32 = 2;
const O_CREATE: u32 = 4;

impl<P: Platform> Kernel<P> {
    /// Copy bytes out of task memory.
    fn copy_in(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let arena = self.user_arena.lock();
        arena.bytes(addr, len).map(|bytes| bytes.to_vec())
    }

    /// Copy a NUL-terminated string out of task memory.
    fn copy_in_str(&self, addr: u32) -> Option<Vec<u8>> {
        let arena = self.user_arena.lock();
        let mut out = Vec::new();
        let mut at = addr;
        loop {
            let byte = *arena.bytes(at, 1)?.first()?;
            if byte == 0 {
                return Some(out);
            }
            if out.len() >= 4096 {
                return None;
            }
            out.push(byte);
            at += 1;
        }
    }

    /// Copy bytes into task memory.
    fn copy_out(&self, addr: u32, data: &[u8]) -> bool {
        let mut arena = self.user_arena.lock();
        match arena.bytes_mut(addr, data.len()) {
            Some(bytes) => {
                bytes.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Dispatch one supervisor call from the current task.
    pub fn dispatch<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        number: u32,
        args: [u32; 4],
    ) -> i32 {
        self.syscalls_handled += 1;
        let caller = self.current as u8;
        trace!("syscall {} from task {}", number, caller);
        match number {
            nr::EXIT => {
                self.exit_current(args[0] as i32);
                0
            }
            nr::YIELD => {
                self.yield_now();
                0
            }
            nr::SLEEP => {
                self.sleep(args[0]);
                0
            }
            nr::TIME => self.platform.now_ms() as i32,

            nr::MALLOC => {
                if args[0] == 0 {
                    return 0;
                }
                self.user_alloc(caller, args[0]).unwrap_or(0) as i32
            }
            nr::FREE => {
                // Freeing memory another task owns is silently ignored.
                let mut arena = self.user_arena.lock();
                if arena.owner_of(args[0]) == Some(caller) {
                    arena.free(args[0]);
                }
                0
            }
            nr::REALLOC => {
                let mut arena = self.user_arena.lock();
                if args[0] != 0 && arena.owner_of(args[0]) != Some(caller) {
                    return 0;
                }
                arena.realloc(caller, args[0], args[1]).unwrap_or(0) as i32
            }

            nr::OPEN => self.sys_open(vol, args[0], args[1]),
            nr::CLOSE => self.sys_close(vol, args[0]),
            nr::READ => self.sys_read(vol, args[0], args[1], args[2]),
            nr::WRITE => self.sys_write(vol, args[0], args[1], args[2]),
            nr::SEEK => self.sys_seek(vol, args[0], args[1] as i32, args[2]),

            nr::PUTCHAR => {
                self.platform.console_putc(args[0] as u8);
                args[0] as i32
            }
            nr::GETCHAR => self.platform.console_getc(),
            nr::PUTS => match self.copy_in_str(args[0]) {
                Some(text) => {
                    for byte in text {
                        self.platform.console_putc(byte);
                    }
                    0
                }
                None => ErrorCode::Inval.as_i32(),
            },

            nr::GPIO_INIT => self.platform.gpio_init(args[0]),
            nr::GPIO_DIR => self.platform.gpio_set_dir(args[0], args[1] != 0),
            nr::GPIO_PUT => self.platform.gpio_put(args[0], args[1] != 0),
            nr::GPIO_GET => self.platform.gpio_get(args[0]),
            nr::GPIO_PULL => self.platform.gpio_pull(args[0], args[1] != 0),

            nr::PWM_INIT => self.platform.pwm_init(args[0]),
            nr::PWM_SET_WRAP => self.platform.pwm_set_wrap(args[0], args[1]),
            nr::PWM_SET_LEVEL => self.platform.pwm_set_level(args[0], args[1]),
            nr::PWM_ENABLE => self.platform.pwm_enable(args[0], args[1] != 0),

            nr::ADC_INIT => self.platform.adc_init(),
            nr::ADC_SELECT => self.platform.adc_select(args[0]),
            nr::ADC_READ => self.platform.adc_read(),
            nr::ADC_TEMP => self.platform.adc_temp(),

            nr::SPI_INIT => self.platform.spi_init(args[0], args[1]),
            nr::SPI_WRITE => match self.copy_in(args[1], args[2] as usize) {
                Some(data) => self.platform.spi_write(args[0], &data),
                None => ErrorCode::Inval.as_i32(),
            },
            nr::SPI_READ | nr::SPI_TRANSFER => {
                let mut data = match self.copy_in(args[1], args[2] as usize) {
                    Some(data) => data,
                    None => return ErrorCode::Inval.as_i32(),
                };
                let result = if number == nr::SPI_READ {
                    self.platform.spi_read(args[0], &mut data)
                } else {
                    self.platform.spi_transfer(args[0], &mut data)
                };
                if !self.copy_out(args[1], &data) {
                    return ErrorCode::Inval.as_i32();
                }
                result
            }

            nr::I2C_INIT => self.platform.i2c_init(args[0], args[1]),
            nr::I2C_WRITE => {
                // args[0] is `port << 8 | addr`.
                let (port, addr) = (args[0] >> 8, args[0] as u8);
                match self.copy_in(args[1], args[2] as usize) {
                    Some(data) => self.platform.i2c_write(port, addr, &data),
                    None => ErrorCode::Inval.as_i32(),
                }
            }
            nr::I2C_READ => {
                let (port, addr) = (args[0] >> 8, args[0] as u8);
                let mut data = vec![0; args[2] as usize];
                let result = self.platform.i2c_read(port, addr, &mut data);
                if !self.copy_out(args[1], &data) {
                    return ErrorCode::Inval.as_i32();
                }
                result
            }

            _ => ErrorCode::Nosys.as_i32(),
        }
    }

    fn sys_open<D: BlockDevice>(&mut self, vol: &mut Volume<D>, path: u32, mode: u32) -> i32 {
        let path = match self.copy_in_str(path) {
            Some(path) => path,
            None => return ErrorCode::Inval.as_i32(),
        };
        let path = String::from_utf8_lossy(&path).into_owned();
        let mut open_mode = OpenMode::empty();
        if mode & O_READ != 0 {
            open_mode |= OpenMode::READ;
        }
        if mode & O_WRITE != 0 {
            open_mode |= OpenMode::WRITE;
        }
        if mode & O_CREATE != 0 {
            open_mode |= OpenMode::CREATE;
        }
        let fd = match self.files.iter().position(|slot| slot.is_none()) {
            Some(fd) => fd,
            None => return ErrorCode::Nomem.as_i32(),
        };
        match vol.open(&path, open_mode) {
            Ok(handle) => {
                self.files[fd] = Some(handle);
                fd as i32
            }
            Err(err) => err.as_i32(),
        }
    }

    fn sys_close<D: BlockDevice>(&mut self, vol: &mut Volume<D>, fd: u32) -> i32 {
        let fd = fd as usize;
        if fd >= MAX_FILES {
            return ErrorCode::Inval.as_i32();
        }
        match self.files[fd].take() {
            Some(handle) => match vol.close(handle) {
                Ok(()) => 0,
                Err(err) => err.as_i32(),
            },
            None => ErrorCode::Inval.as_i32(),
        }
    }

    fn sys_read<D: BlockDevice>(&mut self, vol: &mut Volume<D>, fd: u32, buf: u32, len: u32) -> i32 {
        let fd = fd as usize;
        if fd >= MAX_FILES {
            return ErrorCode::Inval.as_i32();
        }
        let mut handle = match self.files[fd].take() {
            Some(handle) => handle,
            None => return ErrorCode::Inval.as_i32(),
        };
        let mut data = vec![0; len as usize];
        let result = match vol.read(&mut handle, &mut data) {
            Ok(n) => {
                if self.copy_out(buf, &data[..n]) {
                    n as i32
                } else {
                    ErrorCode::Inval.as_i32()
                }
            }
            Err(err) => err.as_i32(),
        };
        self.files[fd] = Some(handle);
        result
    }

    fn sys_write<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        fd: u32,
        buf: u32,
        len: u32,
    ) -> i32 {
        let fd = fd as usize;
        if fd >= MAX_FILES {
            return ErrorCode::Inval.as_i32();
        }
        let data = match self.copy_in(buf, len as usize) {
            Some(data) => data,
            None => return ErrorCode::Inval.as_i32(),
        };
        let mut handle = match self.files[fd].take() {
            Some(handle) => handle,
            None => return ErrorCode::Inval.as_i32(),
        };
        let result = match vol.write(&mut handle, &data) {
            Ok(n) => n as i32,
            Err(err) => err.as_i32(),
        };
        self.files[fd] = Some(handle);
        result
    }

    fn sys_seek<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        fd: u32,
        offset: i32,
        whence: u32,
    ) -> i32 {
        let fd = fd as usize;
        if fd >= MAX_FILES {
            return ErrorCode::Inval.as_i32();
        }
        let mut handle = match self.files[fd].take() {
            Some(handle) => handle,
            None => return ErrorCode::Inval.as_i32(),
        };
        let base = match whence {
            0 => 0,
            1 => handle.position() as i64,
            2 => handle.size() as i64,
            _ => {
                self.files[fd] = Some(handle);
                return ErrorCode::Inval.as_i32();
            }
        };
        let target = base + offset as i64;
        let result = if !(0..=u32::MAX as i64).contains(&target) {
            ErrorCode::Inval.as_i32()
        } else {
            match vol.seek(&mut handle, target as u32) {
                Ok(()) => 0,
                Err(err) => err.as_i32(),
            }
        };
        self.files[fd] = Some(handle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{format, RamDisk};
    use crate::kernel::{KernelConfig, NullPlatform, TaskState};

    fn fixture() -> (Kernel<NullPlatform>, Volume<RamDisk>) {
        let mut disk = RamDisk::new(4096);
        format(&mut disk, "TEST").unwrap();
        let vol = Volume::mount(disk).unwrap();
        (Kernel::new(KernelConfig::default(), NullPlatform::new()), vol)
    }

    /// Claim slot 1 as a fake running user task.
    fn with_task(kernel: &mut Kernel<NullPlatform>) -> u8 {
        let slot = kernel.task_alloc().unwrap();
        kernel.tasks[slot].state = TaskState::Ready;
        kernel.tasks[slot].priority = 1;
        kernel.tick();
        slot as u8
    }

    #[test]
    fn unknown_number_is_nosys() {
        let (mut k, mut vol) = fixture();
        assert_eq!(k.dispatch(&mut vol, 999, [0; 4]), ErrorCode::Nosys.as_i32());
        assert_eq!(k.syscalls_handled(), 1);
    }

    #[test]
    fn malloc_zero_returns_null() {
        let (mut k, mut vol) = fixture();
        with_task(&mut k);
        assert_eq!(k.dispatch(&mut vol, nr::MALLOC, [0, 0, 0, 0]), 0);
    }

    #[test]
    fn foreign_free_is_ignored() {
        let (mut k, mut vol) = fixture();
        let owner = with_task(&mut k);
        let addr = k.user_alloc(owner + 1, 64).unwrap();
        let before = k.with_user_arena(|arena| arena.free_bytes());
        assert_eq!(k.dispatch(&mut vol, nr::FREE, [addr, 0, 0, 0]), 0);
        assert_eq!(k.with_user_arena(|arena| arena.free_bytes()), before);
        assert_eq!(k.with_user_arena(|arena| arena.owner_of(addr)), Some(owner + 1));
    }

    #[test]
    fn console_round_trip() {
        let (mut k, mut vol) = fixture();
        assert_eq!(k.dispatch(&mut vol, nr::PUTCHAR, [b'x' as u32, 0, 0, 0]), b'x' as i32);
        assert_eq!(k.platform.console, b"x");
        k.platform.input.push_back(b'y');
        assert_eq!(k.dispatch(&mut vol, nr::GETCHAR, [0; 4]), b'y' as i32);
        assert_eq!(k.dispatch(&mut vol, nr::GETCHAR, [0; 4]), -1);
    }

    #[test]
    fn file_syscalls_round_trip() {
        let (mut k, mut vol) = fixture();
        let owner = with_task(&mut k);

        // Stage path and payload in task memory.
        let mem = k.user_alloc(owner, 128).unwrap();
        assert!(k.copy_out(mem, b"log.txt\0"));
        let payload = mem + 32;
        assert!(k.copy_out(payload, b"hello"));

        let fd = k.dispatch(&mut vol, nr::OPEN, [mem, O_WRITE | O_CREATE, 0, 0]);
        assert!(fd >= 0);
        let fd = fd as u32;
        assert_eq!(k.dispatch(&mut vol, nr::WRITE, [fd, payload, 5, 0]), 5);
        assert_eq!(k.dispatch(&mut vol, nr::CLOSE, [fd, 0, 0, 0]), 0);

        let fd = k.dispatch(&mut vol, nr::OPEN, [mem, O_READ, 0, 0]) as u32;
        let read_buf = mem + 64;
        assert_eq!(k.dispatch(&mut vol, nr::READ, [fd, read_buf, 5, 0]), 5);
        assert_eq!(k.dispatch(&mut vol, nr::CLOSE, [fd, 0, 0, 0]), 0);
        assert_eq!(k.copy_in(read_buf, 5).unwrap(), b"hello");
    }

    #[test]
    fn whence_validation() {
        let (mut k, mut vol) = fixture();
        let owner = with_task(&mut k);
        let mem = k.user_alloc(owner, 64).unwrap();
        assert!(k.copy_out(mem, b"s.bin\0"));
        let fd = k.dispatch(&mut vol, nr::OPEN, [mem, O_WRITE | O_CREATE, 0, 0]) as u32;
        assert_eq!(
            k.dispatch(&mut vol, nr::SEEK, [fd, 0, 7, 0]),
            ErrorCode::Inval.as_i32()
        );
        assert_eq!(k.dispatch(&mut vol, nr::SEEK, [fd, 0, 0, 0]), 0);
    }

    #[test]
    fn name_table_matches_contract() {
        assert_eq!(syscall_by_name(b"sleep_ms"), Some(2));
        assert_eq!(syscall_by_name(b"gpio_init"), Some(40));
        assert_eq!(syscall_by_name(b"i2c_read"), Some(82));
        assert_eq!(syscall_by_name(b"not_a_syscall"), None);
    }
}
