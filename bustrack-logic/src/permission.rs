use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    /// Location while the app is on screen
    Foreground,
    /// Location while the app is backgrounded, needed for continuous tracking
    Background,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionState {
    #[default]
    Unknown,
    Denied,
    ForegroundGranted,
    BackgroundGranted,
}

impl PermissionState {
    /// Whether this state grants `level`, not accounting for platforms without a separate
    /// background permission (see [PermissionGate::satisfies])
    pub fn allows(self, level: PermissionLevel) -> bool {
        match level {
            PermissionLevel::Foreground => matches!(
                self,
                PermissionState::ForegroundGranted | PermissionState::BackgroundGranted
            ),
            PermissionLevel::Background => self == PermissionState::BackgroundGranted,
        }
    }
}

/// Outcome of [PermissionGate::refresh]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The held state still stands
    Unchanged(PermissionState),
    /// The grant at this level was taken away, the gate is now [PermissionState::Denied]
    Revoked(PermissionLevel),
}

/// Platform side of location permissions
pub trait PermissionPrompt: Send + Sync + 'static {
    /// Whether background location is a separate grant on this platform. Older OS versions
    /// only have the one permission.
    fn supports_background(&self) -> bool;
    /// Ask the user for `level`, resolves to whether it was granted
    fn request(&self, level: PermissionLevel) -> impl Future<Output = Result<bool>> + Send;
    /// Check if `level` is currently granted without prompting
    fn check(&self, level: PermissionLevel) -> impl Future<Output = Result<bool>> + Send;
}

/// Requests location access in the right order and remembers the outcome.
pub struct PermissionGate<P: PermissionPrompt> {
    prompt: P,
    state: RwLock<PermissionState>,
}

impl<P: PermissionPrompt> PermissionGate<P> {
    pub fn new(prompt: P) -> Self {
        Self {
            prompt,
            state: RwLock::new(PermissionState::Unknown),
        }
    }

    pub async fn state(&self) -> PermissionState {
        *self.state.read().await
    }

    pub fn prompt(&self) -> &P {
        &self.prompt
    }

    /// Whether `state` is enough to track at `level` on this platform
    pub fn satisfies(&self, state: PermissionState, level: PermissionLevel) -> bool {
        match level {
            PermissionLevel::Background if !self.prompt.supports_background() => {
                state.allows(PermissionLevel::Foreground)
            }
            _ => state.allows(level),
        }
    }

    async fn ask(&self, level: PermissionLevel) -> bool {
        match self.prompt.request(level).await {
            Ok(granted) => granted,
            Err(why) => {
                warn!("Error requesting {level:?} location permission: {why:?}");
                false
            }
        }
    }

    async fn run_prompts(&self, level: PermissionLevel) -> PermissionState {
        if !self.ask(PermissionLevel::Foreground).await {
            return PermissionState::Denied;
        }

        info!("Foreground location permission granted");

        if level == PermissionLevel::Foreground || !self.prompt.supports_background() {
            return PermissionState::ForegroundGranted;
        }

        if self.ask(PermissionLevel::Background).await {
            info!("Background location permission granted");
            PermissionState::BackgroundGranted
        } else {
            PermissionState::ForegroundGranted
        }
    }

    /// Prompt for `level`, foreground always goes first. Every call prompts again, a previous
    /// denial doesn't stop a later request from succeeding.
    pub async fn request_permission(&self, level: PermissionLevel) -> PermissionState {
        let state = self.run_prompts(level).await;
        *self.state.write().await = state;
        state
    }

    /// Re-check the held grant without prompting, drops to [PermissionState::Denied] if it was
    /// revoked in the meantime.
    pub async fn refresh(&self) -> Refresh {
        let current = self.state().await;

        let held = match current {
            PermissionState::BackgroundGranted => PermissionLevel::Background,
            PermissionState::ForegroundGranted => PermissionLevel::Foreground,
            other => return Refresh::Unchanged(other),
        };

        let still_granted = match self.prompt.check(held).await {
            Ok(granted) => granted,
            Err(why) => {
                warn!("Error checking {held:?} location permission: {why:?}");
                false
            }
        };

        if still_granted {
            Refresh::Unchanged(current)
        } else {
            warn!("{held:?} location permission was revoked");
            *self.state.write().await = PermissionState::Denied;
            Refresh::Revoked(held)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::test;

    use super::*;
    use crate::tests::MockPrompt;

    #[test]
    async fn test_foreground_before_background() {
        let gate = PermissionGate::new(MockPrompt::granting(true));

        let state = gate.request_permission(PermissionLevel::Background).await;

        assert_eq!(state, PermissionState::BackgroundGranted);
        assert_eq!(gate.state().await, PermissionState::BackgroundGranted);
        assert_eq!(
            gate.prompt().asked(),
            vec![PermissionLevel::Foreground, PermissionLevel::Background]
        );
    }

    #[test]
    async fn test_foreground_denied_skips_background() {
        let prompt = MockPrompt::granting(true);
        prompt.set_answer(PermissionLevel::Foreground, false);
        let gate = PermissionGate::new(prompt);

        let state = gate.request_permission(PermissionLevel::Background).await;

        assert_eq!(state, PermissionState::Denied);
        assert_eq!(gate.prompt().asked(), vec![PermissionLevel::Foreground]);
        assert!(!gate.satisfies(state, PermissionLevel::Foreground));
    }

    #[test]
    async fn test_background_denied() {
        let prompt = MockPrompt::granting(true);
        prompt.set_answer(PermissionLevel::Background, false);
        let gate = PermissionGate::new(prompt);

        let state = gate.request_permission(PermissionLevel::Background).await;

        assert_eq!(state, PermissionState::ForegroundGranted);
        assert!(gate.satisfies(state, PermissionLevel::Foreground));
        assert!(!gate.satisfies(state, PermissionLevel::Background));
    }

    #[test]
    async fn test_no_background_concept() {
        let gate = PermissionGate::new(MockPrompt::granting(false));

        let state = gate.request_permission(PermissionLevel::Background).await;

        assert_eq!(state, PermissionState::ForegroundGranted);
        assert_eq!(gate.prompt().asked(), vec![PermissionLevel::Foreground]);
        assert!(gate.satisfies(state, PermissionLevel::Background));
    }

    #[test]
    async fn test_prompt_error_is_denial() {
        let prompt = MockPrompt::granting(true);
        prompt.fail_requests();
        let gate = PermissionGate::new(prompt);

        let state = gate.request_permission(PermissionLevel::Foreground).await;

        assert_eq!(state, PermissionState::Denied);
        assert_eq!(gate.prompt().asked().len(), 1, "Prompt should not be retried");
    }

    #[test]
    async fn test_denial_not_sticky() {
        let prompt = MockPrompt::granting(true);
        prompt.set_answer(PermissionLevel::Foreground, false);
        let gate = PermissionGate::new(prompt);

        assert_eq!(
            gate.request_permission(PermissionLevel::Background).await,
            PermissionState::Denied
        );

        gate.prompt().set_answer(PermissionLevel::Foreground, true);

        assert_eq!(
            gate.request_permission(PermissionLevel::Background).await,
            PermissionState::BackgroundGranted
        );
    }

    #[test]
    async fn test_refresh_detects_revocation() {
        let gate = PermissionGate::new(MockPrompt::granting(true));
        gate.request_permission(PermissionLevel::Background).await;

        assert_eq!(
            gate.refresh().await,
            Refresh::Unchanged(PermissionState::BackgroundGranted)
        );

        gate.prompt().set_answer(PermissionLevel::Background, false);

        assert_eq!(
            gate.refresh().await,
            Refresh::Revoked(PermissionLevel::Background)
        );
        assert_eq!(gate.state().await, PermissionState::Denied);
    }

    #[test]
    async fn test_refresh_foreground_only() {
        let gate = PermissionGate::new(MockPrompt::granting(false));
        gate.request_permission(PermissionLevel::Background).await;

        gate.prompt().revoke(PermissionLevel::Foreground);

        assert_eq!(
            gate.refresh().await,
            Refresh::Revoked(PermissionLevel::Foreground)
        );
    }

    #[test]
    async fn test_refresh_without_grant() {
        let gate = PermissionGate::new(MockPrompt::granting(true));

        assert_eq!(
            gate.refresh().await,
            Refresh::Unchanged(PermissionState::Unknown)
        );
        assert!(gate.prompt().asked().is_empty());
    }
}
