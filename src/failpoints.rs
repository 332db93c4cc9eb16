//! Failpoint injection for crash-consistency tests.
//!
//! Compile with `--features failpoints` to make `fp!` consult the registry in
//! [`keel_core::failpoints`]. Without the feature, `fp!` is always `Ok(())`.

pub use keel_core::failpoints::{FailpointAction, check, clear, clear_all, set};

/// Failpoint injection point.
///
/// With the `failpoints` feature this checks the registry and may return
/// [`KeelError::Failpoint`](crate::KeelError::Failpoint), panic or sleep.
///
/// Usage: `fp!("FP_COMMIT_BEFORE_REF_UPDATE")?;`
#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        $crate::failpoints::check($name).map_err(|message| $crate::KeelError::Failpoint {
            name: ($name).to_owned(),
            message,
        })
    };
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        Ok::<(), $crate::KeelError>(())
    };
}
