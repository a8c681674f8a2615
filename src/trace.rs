#![allow(unused_macros)]

// Thin wrappers so call sites read `debug!(...)` the way the rest of the
// crate expects, without every module writing `tracing::` out longhand.

macro_rules! trace {
    ($($arg:tt)+) => { tracing::trace!($($arg)+) }
}

macro_rules! debug {
    ($($arg:tt)+) => { tracing::debug!($($arg)+) }
}

macro_rules! info {
    ($($arg:tt)+) => { tracing::info!($($arg)+) }
}

macro_rules! warn {
    ($($arg:tt)+) => { tracing::warn!($($arg)+) }
}

macro_rules! error {
    ($($arg:tt)+) => { tracing::error!($($arg)+) }
}

macro_rules! debug_span {
    ($($arg:tt)+) => { tracing::debug_span!($($arg)+) }
}

macro_rules! trace_span {
    ($($arg:tt)+) => { tracing::trace_span!($($arg)+) }
}
