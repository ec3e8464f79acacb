use crate::common::value::Value;

// `libc` doesn't re-export `clock()`/`CLOCKS_PER_SEC` for linux-gnu targets,
// so bind the glibc symbol directly; POSIX fixes CLOCKS_PER_SEC at 1_000_000
// on Linux.
unsafe extern "C" {
    fn clock() -> libc::clock_t;
}
const CLOCKS_PER_SEC: libc::clock_t = 1_000_000;

/// clock() -> CPU seconds since process start. The only prelude native.
pub fn native_clock(_argc: usize, _args: &[Value]) -> Value {
    let ticks = unsafe { clock() };
    Value::Number(ticks as f64 / CLOCKS_PER_SEC as f64)
}
