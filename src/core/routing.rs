//! Audio routing bridge
//! Applies accessory connect/disconnect to the audio device selection and
//! turns button events into microphone changes on the active voice call.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};

use crate::core::bluetooth::store::ConnectionStore;
use crate::core::bluetooth::types::{
    AudioAccessory, AudioDevice, AudioDeviceKind, Button, ButtonEvent, VolumeAction,
};
use crate::core::rt::{MaybeSend, MaybeSync};
use crate::error::AccessoryError;

/// Receives microphone state pushed from the call layer (e.g. a system call UI mute button).
pub type MicrophoneCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// The live voice call, when there is one.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait VoiceSession: MaybeSend + MaybeSync {
    fn is_microphone_enabled(&self) -> bool;

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<()>;

    /// Switches call audio to the given endpoints. `None` means platform default.
    async fn route_audio(&self, _microphone: Option<&AudioDevice>, _speaker: Option<&AudioDevice>) -> Result<()> {
        Ok(())
    }

    /// Registers the callback the session invokes on external mute changes.
    fn on_microphone_changed(&self, _callback: MicrophoneCallback) {}
}

/// Short UI sounds. Failures are logged and never abort the caller.
pub trait AudioFeedback: MaybeSend + MaybeSync {
    fn play_device_connected(&self) -> Result<()>;
    fn play_transmit_start(&self) -> Result<()>;
    fn play_transmit_stop(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct AudioRoutingBridge {
    store: ConnectionStore,
    session: Arc<RwLock<Option<Arc<dyn VoiceSession>>>>,
    feedback: Arc<RwLock<Option<Arc<dyn AudioFeedback>>>>,
}

impl AudioRoutingBridge {
    pub fn new(store: ConnectionStore) -> Self {
        Self {
            store,
            session: Arc::new(RwLock::new(None)),
            feedback: Arc::new(RwLock::new(None)),
        }
    }

    /// Binds the active call. Replaces any previous session.
    pub fn attach_session(&self, session: Arc<dyn VoiceSession>) {
        session.on_microphone_changed(self.microphone_callback());
        self.store.set_microphone_enabled(session.is_microphone_enabled());
        if let Ok(mut slot) = self.session.write() {
            *slot = Some(session);
        }
        info!("Voice session attached");
    }

    pub fn detach_session(&self) {
        if let Ok(mut slot) = self.session.write() {
            if slot.take().is_some() {
                info!("Voice session detached");
            }
        }
    }

    pub fn set_feedback(&self, feedback: Arc<dyn AudioFeedback>) {
        if let Ok(mut slot) = self.feedback.write() {
            *slot = Some(feedback);
        }
    }

    /// Callback for the call layer to report microphone changes it made itself.
    pub fn microphone_callback(&self) -> MicrophoneCallback {
        let store = self.store.clone();
        Arc::new(move |enabled| {
            debug!("External microphone change: enabled={}", enabled);
            store.set_microphone_enabled(enabled);
        })
    }

    fn session(&self) -> Option<Arc<dyn VoiceSession>> {
        self.session.read().ok().and_then(|slot| slot.clone())
    }

    fn feedback(&self, play: impl FnOnce(&dyn AudioFeedback) -> Result<()>) {
        let feedback = self.feedback.read().ok().and_then(|slot| slot.clone());
        if let Some(feedback) = feedback {
            if let Err(e) = play(feedback.as_ref()) {
                warn!("Audio feedback failed: {}", e);
            }
        }
    }

    /// Selects the accessory as speaker, and as microphone when it has one.
    pub async fn on_connected(&self, accessory: &AudioAccessory) -> Result<(), AccessoryError> {
        let device = AudioDevice::from_accessory(accessory);
        self.store.add_audio_device(device.clone());
        if accessory.supports_microphone_control {
            self.store.select_microphone(Some(device.clone()));
        }
        self.store.select_speaker(Some(device));
        self.store.set_routing_active(true);
        info!("Audio routed to {}", accessory.name);

        self.feedback(|f| f.play_device_connected());
        self.apply_routing().await
    }

    /// Drops Bluetooth endpoints and falls back to whatever else is available.
    pub async fn on_disconnected(&self) -> Result<(), AccessoryError> {
        self.store.remove_audio_devices_of_kind(AudioDeviceKind::Bluetooth);

        let state = self.store.snapshot();
        let microphone = state
            .selected_microphone
            .or_else(|| state.audio_devices.iter().find(|d| d.is_input).cloned());
        let speaker = state
            .selected_speaker
            .or_else(|| state.audio_devices.iter().find(|d| d.is_output).cloned());
        self.store.select_microphone(microphone);
        self.store.select_speaker(speaker);
        self.store.set_routing_active(false);
        info!("Audio routing reverted to defaults");

        self.apply_routing().await
    }

    async fn apply_routing(&self) -> Result<(), AccessoryError> {
        let Some(session) = self.session() else {
            return Ok(());
        };
        let state = self.store.snapshot();
        session
            .route_audio(state.selected_microphone.as_ref(), state.selected_speaker.as_ref())
            .await
            .map_err(|e| AccessoryError::RoutingFailed(e.to_string()))
    }

    /// Applies a button press to the call. Without an active call only the
    /// volume record is kept.
    pub async fn handle_button(&self, event: &ButtonEvent) {
        match event.button {
            Button::VolumeUp => self.store.record_volume_action(VolumeAction::Up),
            Button::VolumeDown => self.store.record_volume_action(VolumeAction::Down),
            Button::Mute => {
                if let Some(session) = self.session() {
                    let enabled = !session.is_microphone_enabled();
                    self.set_microphone(session.as_ref(), enabled).await;
                }
            }
            Button::PttStart => self.push_to_talk(true).await,
            Button::PttStop => self.push_to_talk(false).await,
            Button::Unknown => debug!("Ignoring unknown button ({:02X?})", event.raw),
        }
    }

    async fn push_to_talk(&self, enabled: bool) {
        let Some(session) = self.session() else {
            return;
        };
        if session.is_microphone_enabled() == enabled {
            return;
        }
        if self.set_microphone(session.as_ref(), enabled).await {
            if enabled {
                self.feedback(|f| f.play_transmit_start());
            } else {
                self.feedback(|f| f.play_transmit_stop());
            }
        }
    }

    async fn set_microphone(&self, session: &dyn VoiceSession, enabled: bool) -> bool {
        match session.set_microphone_enabled(enabled).await {
            Ok(()) => {
                self.store.set_microphone_enabled(enabled);
                info!("Microphone {}", if enabled { "enabled" } else { "disabled" });
                true
            }
            Err(e) => {
                error!("Failed to set microphone enabled={}: {}", enabled, e);
                false
            }
        }
    }
}
