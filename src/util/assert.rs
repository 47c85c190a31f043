/// Panic with an internal assertion message when the condition is false.
///
/// These checks guard invariants that can only break through a programming
/// error inside the crate, never through bad user input.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", assertion_error(message));
    }
}

/// Unconditionally panic with an internal assertion message.
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Build the string used when raising internal assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "Syncstore ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}
