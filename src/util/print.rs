//! Printing that never touches the heap.
//!
//! Diagnostics are emitted from inside the allocator (sometimes while it is
//! the global allocator, sometimes just before `abort()`), so none of this
//! may allocate. `core::fmt` writes straight into `write(2)`.

use std::fmt;

const STDERR_FD: libc::c_int = 2;

/// `stderr`, written with raw `write(2)` calls.
pub struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_all(STDERR_FD, s.as_bytes())
    }
}

fn write_all(fd: libc::c_int, mut bytes: &[u8]) -> fmt::Result {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, `write()` only reads from it
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len() as _) };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(fmt::Error);
        }
        if n == 0 {
            return Err(fmt::Error);
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

/// `print!()`, but to raw stderr and without the allocator
#[macro_export]
macro_rules! eput {
    ($($arg:tt)*) => {{
        let _ = ::std::fmt::Write::write_fmt(
            &mut $crate::util::print::Stderr,
            format_args!($($arg)*),
        );
    }};
}

/// `eprintln!()`, but without the allocator
#[macro_export]
macro_rules! eputln {
    () => {
        $crate::eput!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::eput!($($arg)*);
        $crate::eput!("\n");
    }};
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::*;

    #[test]
    fn stderr_accepts_formatted_output() {
        assert!(write!(Stderr, "{}", "").is_ok());
        eputln!();
    }

    #[test]
    fn bad_descriptors_are_errors() {
        assert!(write_all(-1, b"lost").is_err());
        assert!(write_all(-1, b"").is_ok());
    }
}
