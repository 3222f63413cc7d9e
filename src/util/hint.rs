/// mark some stuff as #[cold]
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}

/// Branch hint for the error side of a check. `#[cold]` on the empty callee
/// is enough to push the taken branch out of line.
#[inline(always)]
pub fn unlikely(b: bool) -> bool {
    #[cold]
    fn unlikely_path() {}

    if b {
        unlikely_path();
    }
    b
}
