//! Install/activate lifecycle state machine
//!
//! `Idle -> Installing -> Installed -> Activating -> Active`
//!
//! A failed install returns to whatever state preceded it, so an active
//! generation keeps serving. `Active` lasts until the next install begins.
//! Clearing drops every generation and ends in `Idle`.

use offline_storage::RequestKey;
use serde::Serialize;
use std::fmt;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Nothing installed yet
    Idle,
    Installing,
    /// Precached and waiting for activation
    Installed,
    Activating,
    Active,
    /// Every generation is being deleted
    Clearing,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Clearing => "clearing",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully precached generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub name: String,
    pub version: String,
    /// Key of the offline fallback page inside this generation
    pub offline_key: RequestKey,
    pub precached: usize,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    /// State to return to if the current install or activation fails
    resume_state: LifecycleState,
    active: Option<Generation>,
    pending: Option<Generation>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            resume_state: LifecycleState::Idle,
            active: None,
            pending: None,
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn active(&self) -> Option<&Generation> {
        self.active.as_ref()
    }

    pub fn pending(&self) -> Option<&Generation> {
        self.pending.as_ref()
    }

    /// The only generation requests may read from or write to.
    ///
    /// Nothing is served while generations are being deleted.
    pub fn serving(&self) -> Option<&Generation> {
        match self.state {
            LifecycleState::Activating | LifecycleState::Clearing => None,
            _ => self.active.as_ref(),
        }
    }

    pub fn is_serving(&self, name: &str) -> bool {
        self.serving().is_some_and(|g| g.name == name)
    }

    fn ensure_idle(&self) -> Result<(), CoreError> {
        match self.state {
            LifecycleState::Installing | LifecycleState::Activating | LifecycleState::Clearing => {
                Err(CoreError::Busy(self.state))
            }
            _ => Ok(()),
        }
    }

    pub fn begin_install(&mut self) -> Result<(), CoreError> {
        self.ensure_idle()?;
        self.resume_state = self.state;
        self.state = LifecycleState::Installing;
        Ok(())
    }

    pub fn install_succeeded(&mut self, generation: Generation) {
        self.pending = Some(generation);
        self.state = LifecycleState::Installed;
    }

    pub fn install_failed(&mut self) {
        self.state = self.resume_state;
    }

    /// Start activating the pending generation, or re-run activation of the
    /// active one when nothing is pending. Returns the generation to keep.
    pub fn begin_activate(&mut self) -> Result<Generation, CoreError> {
        self.ensure_idle()?;

        let target = self
            .pending
            .clone()
            .or_else(|| self.active.clone())
            .ok_or(CoreError::NothingToActivate)?;

        self.resume_state = self.state;
        self.state = LifecycleState::Activating;
        Ok(target)
    }

    pub fn activation_succeeded(&mut self, generation: Generation) {
        self.pending = None;
        self.active = Some(generation);
        self.state = LifecycleState::Active;
    }

    pub fn activation_failed(&mut self) {
        self.state = self.resume_state;
    }

    /// Forget every generation ahead of deleting them all
    pub fn begin_clear(&mut self) -> Result<(), CoreError> {
        self.ensure_idle()?;
        self.active = None;
        self.pending = None;
        self.state = LifecycleState::Clearing;
        Ok(())
    }

    pub fn clear_finished(&mut self) {
        self.state = LifecycleState::Idle;
    }

    /// Adopt a generation that is already complete in the store
    pub fn resume(&mut self, generation: Generation) -> Result<(), CoreError> {
        self.ensure_idle()?;
        self.active = Some(generation);
        self.state = LifecycleState::Active;
        Ok(())
    }
}
