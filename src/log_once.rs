/// Logs a message at warn severity the first time the call site fires,
/// at info severity afterwards.
#[macro_export]
macro_rules! warn_once_or_info {
    ($($t:tt)*) => {{
        static FIRED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        log::log!(
            if FIRED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                log::Level::Info
            } else {
                log::Level::Warn
            },
            $($t)*
        );
    }};
}

/// Logs a message at info severity only the first time the call site fires.
#[macro_export]
macro_rules! info_once {
    ($($t:tt)*) => {{
        static FIRED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        if !FIRED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            log::info!($($t)*);
        }
    }};
}
