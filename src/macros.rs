//! Internal logging macros

/// Per-fault tracing, compiled in only with the `page_fault_debug` feature
#[cfg(feature = "page_fault_debug")]
macro_rules! fault_trace {
    ($($arg:tt)*) => {
        log::trace!(target: "vm_region::fault", $($arg)*)
    };
}

/// Per-fault tracing, compiled in only with the `page_fault_debug` feature
#[cfg(not(feature = "page_fault_debug"))]
macro_rules! fault_trace {
    ($($arg:tt)*) => {
        if false {
            log::trace!(target: "vm_region::fault", $($arg)*)
        }
    };
}
