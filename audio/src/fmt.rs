//! Logging macros.
//!
//! Forward to `defmt` when the `defmt` feature is enabled. Otherwise, the arguments are only type-checked, so that
//! host builds need no logger.
#![allow(unused_macros)]

#[cfg(feature = "defmt")]
macro_rules! trace {
    ($($x:tt)*) => { ::defmt::trace!($($x)*) };
}

#[cfg(feature = "defmt")]
macro_rules! debug {
    ($($x:tt)*) => { ::defmt::debug!($($x)*) };
}

#[cfg(feature = "defmt")]
macro_rules! info {
    ($($x:tt)*) => { ::defmt::info!($($x)*) };
}

#[cfg(feature = "defmt")]
macro_rules! warn {
    ($($x:tt)*) => { ::defmt::warn!($($x)*) };
}

#[cfg(feature = "defmt")]
macro_rules! error {
    ($($x:tt)*) => { ::defmt::error!($($x)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{ let _ = ($( & $x ),*); }};
}
