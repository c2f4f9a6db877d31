/// Report a protocol violation and abort the current operation.
///
/// The message is logged at `error` level first, because the panic may happen in the service
/// process where nobody reads stderr. With `panic = "abort"` (the release profile) this terminates
/// the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        panic!($($arg)+)
    }};
}
