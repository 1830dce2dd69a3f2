// SPDX-License-Identifier: GPL-3.0-only

//! Process-wide runtime configuration and observable stage configuration
//!
//! [`RuntimeConfig`] holds the feature toggles every stage reads and
//! out-of-pipeline actors write (settings IPC, privacy switch events). All
//! access goes through one internal lock and every getter returns a copy.
//!
//! [`ObservableConfig`] is the contract a stage needs from its options
//! source: a value, a way to replace it, and a change callback.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::SCRATCH_DIR_NAME;
use crate::errors::PipelineResult;

/// State of the hardware privacy switch
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum PrivacySwitchState {
    /// No event received yet, or the device has no switch
    #[default]
    Unknown,
    /// Camera is covered; frames must be blacked out
    On,
    Off,
}

/// Visual effect applied by the effects stage
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum EffectSelection {
    #[default]
    None,
    Blur,
    Relight,
    Replace,
}

impl EffectSelection {
    pub const ALL: [EffectSelection; 4] = [
        EffectSelection::None,
        EffectSelection::Blur,
        EffectSelection::Relight,
        EffectSelection::Replace,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            EffectSelection::None => "None",
            EffectSelection::Blur => "Background blur",
            EffectSelection::Relight => "Portrait relight",
            EffectSelection::Replace => "Background replace",
        }
    }
}

/// Effects stage settings
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub effect: EffectSelection,
    /// Blur strength, 0 (subtle) to 100 (maximum)
    pub blur_level: u32,
    /// Image used by [`EffectSelection::Replace`]
    pub replace_image: Option<PathBuf>,
}

impl EffectsConfig {
    pub const MAX_BLUR_LEVEL: u32 = 100;

    pub fn is_enabled(&self) -> bool {
        self.effect != EffectSelection::None
    }
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            effect: EffectSelection::None,
            blur_level: 50,
            replace_image: None,
        }
    }
}

/// Complete runtime settings, as returned by [`RuntimeConfig::snapshot`]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub privacy_switch_state: PrivacySwitchState,
    pub sw_privacy_switch_enabled: bool,
    pub effects: EffectsConfig,
    pub auto_framing_enabled: bool,
    pub scratch_dir: PathBuf,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            privacy_switch_state: PrivacySwitchState::Unknown,
            sw_privacy_switch_enabled: false,
            effects: EffectsConfig::default(),
            auto_framing_enabled: false,
            scratch_dir: default_scratch_dir(),
        }
    }
}

/// Scratch directory under the platform cache dir, falling back to the temp dir
pub fn default_scratch_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SCRATCH_DIR_NAME)
}

/// Lock-protected runtime settings shared by all stages
#[derive(Debug, Default)]
pub struct RuntimeConfig {
    settings: Mutex<RuntimeSettings>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: RuntimeSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn privacy_switch_state(&self) -> PrivacySwitchState {
        self.lock().privacy_switch_state
    }

    pub fn set_privacy_switch_state(&self, state: PrivacySwitchState) {
        info!(state = ?state, "Privacy switch state changed");
        self.lock().privacy_switch_state = state;
    }

    pub fn is_sw_privacy_switch_enabled(&self) -> bool {
        self.lock().sw_privacy_switch_enabled
    }

    pub fn set_sw_privacy_switch_enabled(&self, enabled: bool) {
        self.lock().sw_privacy_switch_enabled = enabled;
    }

    /// Whether frames must be muted, from either the hardware or software switch
    pub fn is_privacy_muted(&self) -> bool {
        let settings = self.lock();
        settings.privacy_switch_state == PrivacySwitchState::On
            || settings.sw_privacy_switch_enabled
    }

    pub fn effects_config(&self) -> EffectsConfig {
        self.lock().effects.clone()
    }

    pub fn set_effects_config(&self, mut effects: EffectsConfig) {
        effects.blur_level = effects.blur_level.min(EffectsConfig::MAX_BLUR_LEVEL);
        debug!(effect = ?effects.effect, blur = effects.blur_level, "Effects config updated");
        self.lock().effects = effects;
    }

    pub fn is_auto_framing_enabled(&self) -> bool {
        self.lock().auto_framing_enabled
    }

    pub fn set_auto_framing_enabled(&self, enabled: bool) {
        self.lock().auto_framing_enabled = enabled;
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.lock().scratch_dir.clone()
    }

    pub fn set_scratch_dir(&self, dir: impl Into<PathBuf>) {
        self.lock().scratch_dir = dir.into();
    }

    /// Copy of every setting, taken under a single lock acquisition
    pub fn snapshot(&self) -> RuntimeSettings {
        self.lock().clone()
    }
}

type ChangeCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Observed<T> {
    value: T,
    callbacks: Vec<ChangeCallback<T>>,
}

/// Configuration value with change notification
pub struct ObservableConfig<T> {
    inner: Mutex<Observed<T>>,
    // Serializes changes with their notifications
    notify_lock: Mutex<()>,
}

impl<T> ObservableConfig<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Observed {
                value,
                callbacks: Vec::new(),
            }),
            notify_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Observed<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Register a callback run after every change.
    ///
    /// Callbacks run on the thread that applied the change, in the order the
    /// changes were applied. They may read the value but must not call
    /// [`ObservableConfig::set`].
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.lock().callbacks.push(Arc::new(callback));
    }

    /// Replace the value and notify every callback
    pub fn set(&self, value: T) {
        let _notifying = self
            .notify_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let callbacks = {
            let mut inner = self.lock();
            inner.value = value.clone();
            inner.callbacks.clone()
        };
        for callback in &callbacks {
            callback(&value);
        }
    }
}

impl<T> ObservableConfig<T>
where
    T: Clone + Send + DeserializeOwned + 'static,
{
    /// Parse a JSON document and apply it; the value is unchanged on error
    pub fn update_from_json(&self, json: &str) -> PipelineResult<()> {
        let value: T = serde_json::from_str(json)?;
        self.set(value);
        Ok(())
    }
}

impl<T: Clone + Default + Send + 'static> Default for ObservableConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
