// Architecture primitives
//
// Everything that differs by target CPU lives behind this module so the
// rest of the loader can stay architecture-neutral. Only x86_64 is
// implemented; a loader built for any other target fails to compile
// rather than silently accepting an unsupported machine.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;
