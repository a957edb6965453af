//! Application-facing annotation surface: `HAPPENS_BEFORE`/`HAPPENS_AFTER`
//! and a scoped `ENTER_EXCLUDE`/`LEAVE_EXCLUDE` pair. Compile to no-ops when
//! the `annotations` feature is off, so instrumented code can ship the
//! macro calls unconditionally.

/// Publish the calling thread's current clock under `id`, then tick its own
/// component. See [`crate::engine::Engine::happens_before`].
#[macro_export]
#[cfg(feature = "annotations")]
macro_rules! HAPPENS_BEFORE {
    ($engine:expr, $tls:expr, $id:expr) => {
        $engine.happens_before($tls, $id)
    };
}

#[macro_export]
#[cfg(not(feature = "annotations"))]
macro_rules! HAPPENS_BEFORE {
    ($engine:expr, $tls:expr, $id:expr) => {
        ()
    };
}

/// Join the calling thread's clock with whatever was published under `id`.
/// A no-op if `id` was never published. See
/// [`crate::engine::Engine::happens_after`].
#[macro_export]
#[cfg(feature = "annotations")]
macro_rules! HAPPENS_AFTER {
    ($engine:expr, $tls:expr, $id:expr) => {
        $engine.happens_after($tls, $id)
    };
}

#[macro_export]
#[cfg(not(feature = "annotations"))]
macro_rules! HAPPENS_AFTER {
    ($engine:expr, $tls:expr, $id:expr) => {
        ()
    };
}

/// Scoped disable: drops memory events on the calling thread until the
/// matching `LEAVE_EXCLUDE`. Sync events are still processed underneath, so
/// nested annotations keep working.
#[macro_export]
#[cfg(feature = "annotations")]
macro_rules! ENTER_EXCLUDE {
    ($engine:expr, $tls:expr) => {
        $engine.enter_exclude($tls)
    };
}

#[macro_export]
#[cfg(not(feature = "annotations"))]
macro_rules! ENTER_EXCLUDE {
    ($engine:expr, $tls:expr) => {
        ()
    };
}

#[macro_export]
#[cfg(feature = "annotations")]
macro_rules! LEAVE_EXCLUDE {
    ($engine:expr, $tls:expr) => {
        $engine.leave_exclude($tls)
    };
}

#[macro_export]
#[cfg(not(feature = "annotations"))]
macro_rules! LEAVE_EXCLUDE {
    ($engine:expr, $tls:expr) => {
        ()
    };
}
