//! The hardware surface the kernel forwards syscalls to.
//!
//! Console, clock, and the driver families from the syscall table. The
//! real target implements this over the SDK; [`NullPlatform`] backs tests
//! and records console traffic. Driver defaults are no-ops returning
//! success so a platform only implements what it has.

use std::collections::VecDeque;

/// Platform services consumed by the kernel.
pub trait Platform {
    /// Milliseconds since boot.
    fn now_ms(&mut self) -> u32;

    fn console_putc(&mut self, byte: u8);

    /// Next console byte, or -1 when none is pending.
    fn console_getc(&mut self) -> i32 {
        -1
    }

    fn gpio_init(&mut self, _pin: u32) -> i32 {
        0
    }
    fn gpio_set_dir(&mut self, _pin: u32, _output: bool) -> i32 {
        0
    }
    fn gpio_put(&mut self, _pin: u32, _value: bool) -> i32 {
        0
    }
    fn gpio_get(&mut self, _pin: u32) -> i32 {
        0
    }
    fn gpio_pull(&mut self, _pin: u32, _up: bool) -> i32 {
        0
    }

    fn pwm_init(&mut self, _slice: u32) -> i32 {
        0
    }
    fn pwm_set_wrap(&mut self, _slice: u32, _wrap: u32) -> i32 {
        0
    }
    fn pwm_set_level(&mut self, _slice: u32, _level: u32) -> i32 {
        0
    }
    fn pwm_enable(&mut self, _slice: u32, _enable: bool) -> i32 {
        0
    }

    fn adc_init(&mut self) -> i32 {
        0
    }
    fn adc_select(&mut self, _channel: u32) -> i32 {
        0
    }
    /// Raw 12-bit conversion.
    fn adc_read(&mut self) -> i32 {
        0
    }
    /// Raw reading of the temperature channel.
    fn adc_temp(&mut self) -> i32 {
        0
    }

    fn spi_init(&mut self, _port: u32, _baud: u32) -> i32 {
        0
    }
    fn spi_write(&mut self, _port: u32, data: &[u8]) -> i32 {
        data.len() as i32
    }
    fn spi_read(&mut self, _port: u32, data: &mut [u8]) -> i32 {
        data.len() as i32
    }
    fn spi_transfer(&mut self, _port: u32, data: &mut [u8]) -> i32 {
        data.len() as i32
    }

    fn i2c_init(&mut self, _port: u32, _baud: u32) -> i32 {
        0
    }
    fn i2c_write(&mut self, _port: u32, _addr: u8, data: &[u8]) -> i32 {
        data.len() as i32
    }
    fn i2c_read(&mut self, _port: u32, _addr: u8, data: &mut [u8]) -> i32 {
        data.len() as i32
    }
}

/// A platform with a manual clock and an in-memory console, for tests
/// and host-side runs.
#[derive(Debug, Default)]
pub struct NullPlatform {
    clock_ms: u32,
    /// Everything written through `console_putc`.
    pub console: Vec<u8>,
    /// Bytes handed out by `console_getc`.
    pub input: VecDeque<u8>,
    /// `(pin, level)` pairs in `gpio_put` order.
    pub gpio_log: Vec<(u32, bool)>,
}

impl NullPlatform {
    pub fn new() -> Self {
        NullPlatform::default()
    }

    /// Advance the manual clock.
    pub fn advance(&mut self, ms: u32) {
        self.clock_ms += ms;
    }
}

impl Platform for NullPlatform {
    fn now_ms(&mut self) -> u32 {
        self.clock_ms
    }

    fn console_putc(&mut self, byte: u8) {
        self.console.push(byte);
    }

    fn console_getc(&mut self) -> i32 {
        match self.input.pop_front() {
            Some(byte) => byte as i32,
            None => -1,
        }
    }

    fn gpio_put(&mut self, pin: u32, value: bool) -> i32 {
        self.gpio_log.push((pin, value));
        0
    }
}
