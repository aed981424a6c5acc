// Metric macros. Without `telemetry` each one expands to a `Noop` handle, so
// call sites never carry their own cfg.
#[cfg(feature = "telemetry")]
#[macro_use]
#[allow(unused_macros)]
mod enabled {
    macro_rules! t_counter {
        ($($args:tt)*) => { metrics::counter!($($args)*) };
    }

    macro_rules! t_histogram {
        ($($args:tt)*) => { metrics::histogram!($($args)*) };
    }

    macro_rules! t_gauge {
        ($($args:tt)*) => { metrics::gauge!($($args)*) };
    }
}

#[cfg(not(feature = "telemetry"))]
#[macro_use]
#[allow(unused_macros)]
mod disabled {
    macro_rules! t_counter {
        ($($args:tt)*) => { $crate::macros::Noop };
    }

    macro_rules! t_histogram {
        ($($args:tt)*) => { $crate::macros::Noop };
    }

    macro_rules! t_gauge {
        ($($args:tt)*) => { $crate::macros::Noop };
    }
}

/// Accepts every counter, histogram and gauge operation and drops it.
#[cfg(not(feature = "telemetry"))]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Noop;

#[cfg(not(feature = "telemetry"))]
impl Noop {
    pub(crate) fn increment(&self, _value: u64) {}

    pub(crate) fn record(&self, _value: f64) {}

    pub(crate) fn set(&self, _value: f64) {}
}
