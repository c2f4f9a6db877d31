mod unix_common;
pub(crate) use self::unix_common::*;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub(crate) use self::linux::*;
    } else {
        mod fallback;
        pub(crate) use self::fallback::*;
    }
}
