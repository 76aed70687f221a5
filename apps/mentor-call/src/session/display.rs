use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisplayError {
    #[error("fullscreen request refused: {0}")]
    Refused(String),
    #[error("fullscreen is not supported here")]
    Unsupported,
}

/// Best-effort window control. Failures never change call state.
pub trait DisplayControl: Send + Sync + 'static {
    fn is_fullscreen(&self) -> bool;
    fn enter_fullscreen(&self) -> Result<(), DisplayError>;
    fn exit_fullscreen(&self) -> Result<(), DisplayError>;
}

/// Tracks the fullscreen flag without a window. Can be told to refuse
/// requests the way a locked-down environment would.
#[derive(Debug, Default)]
pub struct HeadlessDisplay {
    fullscreen: AtomicBool,
    refuse: bool,
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            fullscreen: AtomicBool::new(false),
            refuse: true,
        }
    }
}

impl DisplayControl for HeadlessDisplay {
    fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }

    fn enter_fullscreen(&self) -> Result<(), DisplayError> {
        if self.refuse {
            return Err(DisplayError::Refused("not allowed by environment".into()));
        }
        self.fullscreen.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn exit_fullscreen(&self) -> Result<(), DisplayError> {
        self.fullscreen.store(false, Ordering::SeqCst);
        Ok(())
    }
}
