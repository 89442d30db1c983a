use harvest_core::ErrorClass;
use serde::{Deserialize, Serialize};

/// Whether the engine may traverse and extract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cooldown {
    #[default]
    Running,
    Cooling,
}

/// What the engine must do after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Per-item failure; keep going.
    Continue,
    /// Suspend cycles until an operator resets.
    EnteredCooldown,
    /// Persist and stop the process.
    Fatal,
}

impl Cooldown {
    pub fn is_cooling(self) -> bool {
        self == Self::Cooling
    }

    pub fn on_failure(&mut self, class: ErrorClass) -> Transition {
        match class {
            ErrorClass::PerItem => Transition::Continue,
            ErrorClass::Transient => {
                *self = Self::Cooling;
                Transition::EnteredCooldown
            }
            ErrorClass::Fatal => Transition::Fatal,
        }
    }

    /// Returns `true` when the state actually changed.
    pub fn reset(&mut self) -> bool {
        let was_cooling = self.is_cooling();
        *self = Self::Running;
        was_cooling
    }
}
