//! Kernel print utilities.
//!
//! The kernel does not own a console in the hosted build. Every message is
//! handed to the [`log`] facade instead, and whoever embeds the kernel decides
//! where the records go.

/// Display an information message.
///
/// Use the format! syntax to write data to the kernel log.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::log::info!($($arg)*) });
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the kernel log.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::log::warn!($($arg)*) });
}

/// Display a debug message.
///
/// Use the format! syntax to write data to the kernel log.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::log::debug!($($arg)*) });
}
