use crate::util::constants::{BITS_IN_WORD, BYTES_IN_PAGE, BYTES_IN_WORD, LOG_BYTES_IN_MBYTE};

/// The default size of the shared region.
pub const DEFAULT_SHARED_REGION_SIZE: usize = 16 << LOG_BYTES_IN_MBYTE;
/// The default number of entries in the mark stack and the service-deferred stack.
pub const DEFAULT_MARK_STACK_CAPACITY: usize = 64 * 1024;
/// The default number of entries in each of the allocation and live stacks.
pub const DEFAULT_ALLOCATION_STACK_CAPACITY: usize = 64 * 1024;
/// The default number of addresses a sweep hands to the free callback at once.
pub const DEFAULT_SWEEP_BUFFER_CAPACITY: usize = BYTES_IN_WORD * BITS_IN_WORD;

/// The prefix of environment variables that override option defaults.
pub const ENV_PREFIX: &str = "GCSERVICE_";

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Runtime options. Each process builds its own copy; the mutator and the service process
        /// must agree on the ones that shape shared memory (capacities and sizes).
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from its name and a string value. Invalid values are rejected and
            /// the current value is kept. Returns true if the value was accepted.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            fn defaults() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options::defaults();

                // If we have env vars that start with GCSERVICE_ and match any option (such as
                // GCSERVICE_MARK_STACK_CAPACITY), we set the option to its value (if it is a valid
                // value). Otherwise, use the default value.
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(ENV_PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Size in bytes of the shared region holding the heap header, bitmaps and stacks.
    shared_region_size:        usize [|v: &usize| *v >= BYTES_IN_PAGE] = DEFAULT_SHARED_REGION_SIZE,
    /// Capacity of the shared mark stack. Overflow spills to a process-local stack.
    mark_stack_capacity:       usize [|v: &usize| *v > 0] = DEFAULT_MARK_STACK_CAPACITY,
    /// Capacity of the allocation stack. A full allocation stack triggers a sticky collection.
    allocation_stack_capacity: usize [|v: &usize| *v > 0] = DEFAULT_ALLOCATION_STACK_CAPACITY,
    /// Hand recursive marking to an attached service process when one is available.
    use_gc_service:            bool  [always_valid] = true,
    /// Run background collections concurrently with the mutators.
    concurrent_gc:             bool  [always_valid] = true,
    /// Allow sticky collections. Without them OOM escalation starts at a partial collection.
    enable_sticky_gc:          bool  [always_valid] = true,
    /// Number of garbage addresses a sweep batches before calling the free callback. It must
    /// hold at least one word of bits.
    sweep_buffer_capacity:     usize [|v: &usize| *v >= BITS_IN_WORD] = DEFAULT_SWEEP_BUFFER_CAPACITY,
    /// Check every card value after aging.
    verify_card_table:         bool  [always_valid] = cfg!(feature = "extreme_assertions"),
}
