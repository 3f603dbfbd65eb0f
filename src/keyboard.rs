//! The Virtual Keyboard collaborator boundary: injecting key combos and
//! opening the browser config page are both out of scope (see spec §1) and
//! are modeled purely as a trait so the Controller can call through it
//! without depending on a concrete backend.

pub trait VirtualKeyboard: Send + Sync {
    fn press_combo(&self, combo: &str);
    fn open_url(&self, url: &str);
}

/// The only production implementation: logs the requested action. A real
/// key-injection backend is a collaborator outside this crate's scope.
#[derive(Debug, Default)]
pub struct LoggingKeyboard;

impl VirtualKeyboard for LoggingKeyboard {
    fn press_combo(&self, combo: &str) {
        tracing::info!(combo, "virtual keyboard: press combo");
    }

    fn open_url(&self, url: &str) {
        tracing::info!(url, "virtual keyboard: open browser");
    }
}

#[cfg(test)]
pub mod test_support {
    use std::sync::Mutex;

    use super::VirtualKeyboard;

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedAction {
        PressCombo(String),
        OpenUrl(String),
    }

    #[derive(Default)]
    pub struct RecordingKeyboard {
        pub actions: Mutex<Vec<RecordedAction>>,
    }

    impl VirtualKeyboard for RecordingKeyboard {
        fn press_combo(&self, combo: &str) {
            self.actions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(RecordedAction::PressCombo(combo.to_owned()));
        }

        fn open_url(&self, url: &str) {
            self.actions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(RecordedAction::OpenUrl(url.to_owned()));
        }
    }
}
