//! Utilities shared by every other module: address arithmetic, constants, the OS layer, options
//! and logging.

/// Address arithmetic.
pub mod address;
/// Constants.
pub mod constants;
/// Alignment and unit conversions.
pub mod conversions;
/// Logger initialization.
pub mod logger;
/// Crate macros.
#[macro_use]
pub mod macros;
/// Runtime options.
pub mod options;
/// Memory mappings and futexes.
pub mod os;
/// Workarounds and small combinators missing from the standard library.
pub mod rust_util;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::address::Address;
