//! Failpoint registry for crash and interruption testing.
//!
//! Mutating operations call `fp!("NAME")` between their durable steps. With
//! the `failpoints` feature the macro consults this registry; without it the
//! registry does not exist and arming a failpoint has no effect.

use std::time::Duration;

/// What a failpoint does when reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailpointAction {
    Off,
    /// Make the enclosing operation fail with this message.
    Error(String),
    Panic(String),
    Sleep(Duration),
}

#[cfg(feature = "failpoints")]
mod registry {
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

    use super::FailpointAction;

    static REGISTRY: LazyLock<Mutex<HashMap<&'static str, FailpointAction>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));

    fn registry() -> MutexGuard<'static, HashMap<&'static str, FailpointAction>> {
        REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a failpoint.
    pub fn set(name: &'static str, action: FailpointAction) {
        registry().insert(name, action);
    }

    /// Disarm one failpoint.
    pub fn clear(name: &'static str) {
        registry().remove(name);
    }

    /// Disarm every failpoint.
    pub fn clear_all() {
        registry().clear();
    }

    /// Run the action armed for `name`, if any.
    ///
    /// # Errors
    /// Returns the armed message for [`FailpointAction::Error`].
    ///
    /// # Panics
    /// Panics when the armed action is [`FailpointAction::Panic`].
    pub fn check(name: &str) -> Result<(), String> {
        let action = registry().get(name).cloned();
        match action {
            None | Some(FailpointAction::Off) => Ok(()),
            Some(FailpointAction::Error(msg)) => Err(msg),
            Some(FailpointAction::Panic(msg)) => panic!("failpoint {name}: {msg}"),
            Some(FailpointAction::Sleep(d)) => {
                std::thread::sleep(d);
                Ok(())
            }
        }
    }
}

/// Without the feature nothing is ever armed.
#[cfg(not(feature = "failpoints"))]
mod registry {
    use super::FailpointAction;

    #[allow(clippy::needless_pass_by_value)]
    pub fn set(_name: &'static str, _action: FailpointAction) {}

    pub const fn clear(_name: &'static str) {}

    pub const fn clear_all() {}

    /// # Errors
    /// Never.
    pub const fn check(_name: &str) -> Result<(), String> {
        Ok(())
    }
}

pub use registry::{check, clear, clear_all, set};

#[cfg(test)]
mod tests {
    use super::*;

    // Names are unique per test so parallel tests don't disarm each other.

    #[test]
    fn unarmed_is_ok() {
        assert!(check("FP_CORE_UNARMED").is_ok());
    }

    #[test]
    #[cfg(feature = "failpoints")]
    fn error_action_returns_message() {
        set("FP_CORE_ERROR", FailpointAction::Error("injected".into()));
        assert_eq!(check("FP_CORE_ERROR"), Err("injected".to_owned()));
        clear("FP_CORE_ERROR");
        assert!(check("FP_CORE_ERROR").is_ok());
    }

    #[test]
    #[cfg(feature = "failpoints")]
    fn off_and_sleep_are_ok() {
        set("FP_CORE_OFF", FailpointAction::Off);
        set("FP_CORE_SLEEP", FailpointAction::Sleep(Duration::from_millis(1)));
        assert!(check("FP_CORE_OFF").is_ok());
        assert!(check("FP_CORE_SLEEP").is_ok());
        clear("FP_CORE_OFF");
        clear("FP_CORE_SLEEP");
    }

    #[test]
    #[cfg(feature = "failpoints")]
    #[should_panic(expected = "failpoint FP_CORE_PANIC: boom")]
    fn panic_action_panics() {
        set("FP_CORE_PANIC", FailpointAction::Panic("boom".into()));
        let _ = check("FP_CORE_PANIC");
    }

    #[test]
    #[cfg(not(feature = "failpoints"))]
    fn registry_is_inert_without_feature() {
        set("FP_CORE_INERT", FailpointAction::Panic("boom".into()));
        assert!(check("FP_CORE_INERT").is_ok());
        clear_all();
    }
}
