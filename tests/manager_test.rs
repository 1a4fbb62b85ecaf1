mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use common::{FakeBackend, harness, harness_with, headset, test_config, wait_until};
use ptt_headset_bridge::AccessoryError;
use ptt_headset_bridge::core::bluetooth::types::{
    AdapterState, AudioDevice, Button, DiscoveredDevice, PreferredDevice, ScanMode,
};
use ptt_headset_bridge::core::bluetooth::Vendor;
use ptt_headset_bridge::core::preferences::{MemoryPreferenceStore, load_preferred_device, save_preferred_device};
use ptt_headset_bridge::core::routing::VoiceSession;

#[derive(Default)]
struct CallSession {
    microphone: AtomicBool,
    fail_routing: bool,
    /// How long the platform takes to apply a route.
    route_delay: Option<Duration>,
}

#[async_trait]
impl VoiceSession for CallSession {
    fn is_microphone_enabled(&self) -> bool {
        self.microphone.load(Ordering::SeqCst)
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<()> {
        self.microphone.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn route_audio(&self, _: Option<&AudioDevice>, _: Option<&AudioDevice>) -> Result<()> {
        if let Some(delay) = self.route_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_routing {
            Err(anyhow!("audio session interrupted"))
        } else {
            Ok(())
        }
    }
}

fn ids(devices: &[ptt_headset_bridge::core::bluetooth::AudioAccessory]) -> Vec<&str> {
    devices.iter().map(|device| device.id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_normal_scan_applies_rssi_gate_and_classifier() {
    let backend = FakeBackend::new();
    backend.advertise(headset("near", -55));
    backend.advertise(headset("far", -75));
    backend.advertise(DiscoveredDevice::new("tv", Some("Living Room TV".into()), Some(-40)));
    let h = harness(backend);

    h.manager.initialize().await.unwrap();
    assert!(h.manager.request_permissions().await.unwrap());
    h.manager.start_scanning(Some(1000)).await.unwrap();
    assert!(h.store.is_scanning());

    wait_until(&h.store, |state| !state.is_scanning).await;

    assert_eq!(ids(&h.store.available_devices()), vec!["near"]);
    let backend = h.backend.state();
    assert_eq!(backend.scan_modes, vec![ScanMode::Normal]);
    assert_eq!(backend.stop_scan_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_debug_scan_lists_everything() {
    let backend = FakeBackend::new();
    backend.advertise(headset("near", -55));
    backend.advertise(headset("far", -75));
    backend.advertise(DiscoveredDevice::new("tv", Some("Living Room TV".into()), Some(-40)));
    let h = harness(backend);

    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    h.manager.start_debug_scanning(Some(1000)).await.unwrap();
    wait_until(&h.store, |state| !state.is_scanning).await;

    let devices = h.store.available_devices();
    assert_eq!(ids(&devices), vec!["near", "far", "tv"]);
    let tv = devices.iter().find(|device| device.id == "tv").unwrap();
    assert!(!tv.has_audio_capability);
}

#[tokio::test]
async fn test_scan_and_connect_require_permission() {
    let backend = FakeBackend::new();
    backend.state().permissions = false;
    let h = harness(backend);

    h.manager.initialize().await.unwrap();
    assert!(!h.manager.request_permissions().await.unwrap());

    assert_eq!(h.manager.start_scanning(None).await, Err(AccessoryError::PermissionDenied));
    assert_eq!(
        h.manager.connect_to_device("hs-1").await,
        Err(AccessoryError::PermissionDenied)
    );
    assert!(!h.store.is_scanning());
    assert_eq!(h.backend.state().connect_calls, 0);
}

#[tokio::test]
async fn test_scan_requires_powered_adapter() {
    let backend = FakeBackend::new();
    backend.state().adapter = AdapterState::PoweredOff;
    let h = harness(backend);

    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    assert_eq!(
        h.manager.start_debug_scanning(None).await,
        Err(AccessoryError::AdapterUnavailable(AdapterState::PoweredOff))
    );
    assert!(h.backend.state().scan_modes.is_empty());
}

#[tokio::test]
async fn test_stop_scanning_without_scan_is_harmless() {
    let h = harness(FakeBackend::new());
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    h.manager.stop_scanning().await.unwrap();
    assert!(!h.store.is_scanning());
    assert_eq!(h.backend.state().stop_scan_calls, 0);

    h.manager.start_scanning(None).await.unwrap();
    h.manager.stop_scanning().await.unwrap();
    assert!(!h.store.is_scanning());

    // A new scan can start right away.
    h.manager.start_scanning(None).await.unwrap();
    assert!(h.store.is_scanning());
    h.manager.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_publishes_device_and_remembers_it() {
    let h = harness(FakeBackend::new());
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let accessory = h.manager.connect_to_device("hs-1").await.unwrap();
    assert_eq!(accessory.id, "hs-1");

    let state = h.store.snapshot();
    assert_eq!(state.connected_device.as_ref().map(|d| d.id.as_str()), Some("hs-1"));
    assert!(!state.is_connecting);
    assert!(state.connection_error.is_none());
    assert!(state.routing_active);
    assert_eq!(h.backend.subscriptions("hs-1"), 1);
    assert!(h.manager.is_device_connected("hs-1").await);

    let expected = PreferredDevice::new("hs-1", accessory.name.clone());
    assert_eq!(h.manager.preferred_device(), Some(expected.clone()));
    let saved = load_preferred_device(h.preferences.as_ref()).await.unwrap();
    assert_eq!(saved, Some(expected));
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_then_succeeds() {
    let backend = FakeBackend::new();
    backend.state().connect_failures = 2;
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    h.manager.connect_to_device("hs-1").await.unwrap();
    assert_eq!(h.backend.state().connect_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_clears_connecting_and_records_error() {
    let backend = FakeBackend::new();
    backend.state().connect_failures = 10;
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let result = h.manager.connect_to_device("hs-1").await;
    assert!(matches!(result, Err(AccessoryError::ConnectionFailed(_))));

    let state = h.store.snapshot();
    assert!(!state.is_connecting);
    assert!(state.connected_device.is_none());
    assert!(state.connection_error.unwrap().contains("GATT error 133"));
    assert_eq!(h.backend.state().connect_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let h = harness(FakeBackend::new());
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    h.manager.disconnect_device().await.unwrap();

    h.manager.connect_to_device("hs-1").await.unwrap();
    h.manager.disconnect_device().await.unwrap();
    h.manager.disconnect_device().await.unwrap();

    let state = h.store.snapshot();
    assert!(state.connected_device.is_none());
    assert!(!state.routing_active);
    assert_eq!(h.backend.state().disconnect_calls, vec!["hs-1".to_string()]);
    assert!(!h.manager.is_device_connected("hs-1").await);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_supersedes_connect_in_flight() {
    let backend = FakeBackend::new();
    backend.state().connect_delay = Some(Duration::from_millis(500));
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let manager = h.manager.clone();
    let attempt = tokio::spawn(async move { manager.connect_to_device("hs-1").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.is_connecting());

    h.manager.disconnect_device().await.unwrap();
    let result = attempt.await.unwrap();

    assert_eq!(result, Err(AccessoryError::Superseded));
    let state = h.store.snapshot();
    assert!(state.connected_device.is_none());
    assert!(state.connection_error.is_none());
    assert!(!state.is_connecting);
    assert!(!h.backend.state().connected.contains("hs-1"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_device_switch_wins() {
    let h = harness(FakeBackend::new());
    h.bridge.attach_session(Arc::new(CallSession {
        route_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    }));
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    h.manager.connect_to_device("hs-1").await.unwrap();

    // Releasing hs-1 routes for 100 ms, then hs-2 is routing until 200 ms.
    let manager = h.manager.clone();
    let switch = tokio::spawn(async move { manager.connect_to_device("hs-2").await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.store.is_connecting());
    assert!(h.backend.state().connected.contains("hs-2"));

    h.manager.disconnect_device().await.unwrap();
    let result = switch.await.unwrap();

    assert_eq!(result, Err(AccessoryError::Superseded));
    let state = h.store.snapshot();
    assert!(state.connected_device.is_none());
    assert!(!state.is_connecting);
    assert!(!state.routing_active);
    assert!(h.backend.state().connected.is_empty());
    assert_eq!(h.backend.subscriptions("hs-2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_subscription_fails_the_connect() {
    let backend = FakeBackend::new();
    backend.state().subscribe_failure = true;
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let result = h.manager.connect_to_device("hs-1").await;
    assert!(matches!(result, Err(AccessoryError::ConnectionFailed(_))));

    let state = h.store.snapshot();
    assert!(!state.is_connecting);
    assert!(state.connected_device.is_none());
    assert!(!state.routing_active);
    assert!(state.connection_error.unwrap().contains("CCCD write failed"));
    assert_eq!(h.backend.state().disconnect_calls, vec!["hs-1".to_string()]);
    assert!(h.store.preferred_device().is_none());
}

#[tokio::test]
async fn test_rejected_scan_start_is_reported() {
    let backend = FakeBackend::new();
    backend.state().scan_failure = true;
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let result = h.manager.start_debug_scanning(None).await;
    assert!(matches!(result, Err(AccessoryError::Backend(_))));
    assert!(!h.store.is_scanning());

    // The scanner slot was released, so a later scan can start.
    h.backend.state().scan_failure = false;
    h.manager.start_debug_scanning(None).await.unwrap();
    assert!(h.store.is_scanning());
    assert_eq!(h.backend.state().scan_modes, vec![ScanMode::Debug]);
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_while_connecting_is_rejected() {
    let backend = FakeBackend::new();
    backend.state().connect_delay = Some(Duration::from_millis(500));
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let manager = h.manager.clone();
    let first = tokio::spawn(async move { manager.connect_to_device("hs-1").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        h.manager.connect_to_device("hs-2").await,
        Err(AccessoryError::ConnectInProgress)
    );
    assert!(first.await.unwrap().is_ok());
    assert_eq!(h.manager.get_connected_device().map(|d| d.id), Some("hs-1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_connecting_elsewhere_releases_current_device() {
    let h = harness(FakeBackend::new());
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    h.manager.connect_to_device("hs-1").await.unwrap();
    h.manager.connect_to_device("hs-1").await.unwrap();
    assert_eq!(h.backend.state().connect_calls, 1);

    h.manager.connect_to_device("hs-2").await.unwrap();
    assert_eq!(h.manager.get_connected_device().map(|d| d.id), Some("hs-2".to_string()));
    assert_eq!(h.backend.state().disconnect_calls, vec!["hs-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_button_frames_drive_the_microphone() {
    let h = harness(FakeBackend::new());
    let session = Arc::new(CallSession::default());
    h.bridge.attach_session(session.clone());
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    h.manager.connect_to_device("hs-1").await.unwrap();

    assert!(h.backend.push_frame("hs-1", &[0x01]));
    wait_until(&h.store, |state| state.microphone_enabled).await;
    assert!(session.is_microphone_enabled());

    assert!(h.backend.push_frame("hs-1", &[0x00]));
    wait_until(&h.store, |state| !state.microphone_enabled).await;

    let history = h.store.button_events();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].button, Button::PttStart);
    assert_eq!(history[0].vendor, Vendor::Klein);
    assert_eq!(history[1].button, Button::PttStop);
}

#[tokio::test(start_paused = true)]
async fn test_routing_failure_keeps_link_up() {
    let h = harness(FakeBackend::new());
    h.bridge.attach_session(Arc::new(CallSession {
        fail_routing: true,
        ..Default::default()
    }));
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    let result = h.manager.connect_to_device("hs-1").await;
    assert!(matches!(result, Err(AccessoryError::RoutingFailed(_))));
    assert!(h.manager.get_connected_device().is_some());
    assert!(h.store.connection_error().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_clears_connection_and_reports_it() {
    let backend = FakeBackend::new();
    backend.advertise(headset("hs-1", -50));
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    h.manager.start_debug_scanning(Some(60_000)).await.unwrap();
    wait_until(&h.store, |state| !state.available_devices.is_empty()).await;
    h.manager.stop_scanning().await.unwrap();

    h.manager.connect_to_device("hs-1").await.unwrap();
    h.backend.drop_link("hs-1");

    wait_until(&h.store, |state| state.connected_device.is_none()).await;
    assert_eq!(
        h.store.connection_error().as_deref(),
        Some("Connection to Klein PTT Headset lost")
    );
    assert!(!h.store.snapshot().routing_active);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_off_tears_everything_down() {
    let backend = FakeBackend::new();
    backend.advertise(headset("hs-2", -50));
    let h = harness(backend);
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    h.manager.connect_to_device("hs-1").await.unwrap();
    h.manager.start_debug_scanning(Some(60_000)).await.unwrap();
    wait_until(&h.store, |state| state.available_devices.len() == 2).await;

    h.backend.switch_adapter(AdapterState::PoweredOff);
    wait_until(&h.store, |state| state.adapter_state == AdapterState::PoweredOff).await;
    wait_until(&h.store, |state| {
        !state.is_scanning && state.connected_device.is_none() && state.available_devices.is_empty()
    })
    .await;

    assert!(h.backend.state().disconnect_calls.contains(&"hs-1".to_string()));
    assert_eq!(
        h.manager.start_scanning(None).await,
        Err(AccessoryError::AdapterUnavailable(AdapterState::PoweredOff))
    );
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_fires_once_per_adapter_cycle() {
    let backend = FakeBackend::new();
    backend.advertise(headset("hs-1", -50));
    let preferences = Arc::new(MemoryPreferenceStore::new());
    let preferred = PreferredDevice::new("hs-1", "Klein PTT Headset");
    save_preferred_device(preferences.as_ref(), Some(&preferred)).await.unwrap();
    let h = harness_with(backend, test_config(), preferences);

    h.manager.initialize().await.unwrap();
    assert_eq!(h.manager.preferred_device(), Some(preferred));
    h.manager.request_permissions().await.unwrap();
    wait_until(&h.store, |state| state.connected_device.is_some()).await;
    assert_eq!(h.backend.state().connect_calls, 1);

    // Latched: a manual disconnect is not undone.
    h.manager.disconnect_device().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.connected_device().is_none());
    assert_eq!(h.backend.state().connect_calls, 1);

    // Cycling the adapter re-arms it.
    h.backend.switch_adapter(AdapterState::PoweredOff);
    wait_until(&h.store, |state| state.adapter_state == AdapterState::PoweredOff).await;
    h.backend.switch_adapter(AdapterState::PoweredOn);
    wait_until(&h.store, |state| state.connected_device.is_some()).await;
    assert_eq!(h.backend.state().connect_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn test_revoked_authorization_tears_down_and_rearms_auto_connect() {
    let backend = FakeBackend::new();
    backend.advertise(headset("hs-1", -50));
    backend.advertise(headset("hs-2", -45));
    let preferences = Arc::new(MemoryPreferenceStore::new());
    let preferred = PreferredDevice::new("hs-1", "Klein PTT Headset");
    save_preferred_device(preferences.as_ref(), Some(&preferred)).await.unwrap();
    let h = harness_with(backend, test_config(), preferences);

    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    wait_until(&h.store, |state| state.connected_device.is_some()).await;
    h.manager.stop_scanning().await.unwrap();
    h.manager.start_debug_scanning(Some(60_000)).await.unwrap();
    wait_until(&h.store, |state| state.is_scanning && state.available_devices.len() == 2).await;

    h.backend.switch_adapter(AdapterState::Unauthorized);
    wait_until(&h.store, |state| {
        state.adapter_state == AdapterState::Unauthorized
            && !state.is_scanning
            && state.connected_device.is_none()
            && state.available_devices.is_empty()
    })
    .await;
    assert!(h.backend.state().disconnect_calls.contains(&"hs-1".to_string()));
    assert_eq!(
        h.manager.connect_to_device("hs-1").await,
        Err(AccessoryError::AdapterUnavailable(AdapterState::Unauthorized))
    );

    h.backend.switch_adapter(AdapterState::PoweredOn);
    wait_until(&h.store, |state| state.connected_device.is_some()).await;
    assert_eq!(h.manager.get_connected_device().map(|d| d.id), Some("hs-1".to_string()));
    assert_eq!(h.backend.state().connect_calls, 2);
}

#[tokio::test]
async fn test_auto_connect_can_be_disabled() {
    let backend = FakeBackend::new();
    backend.advertise(headset("hs-1", -50));
    let preferences = Arc::new(MemoryPreferenceStore::new());
    save_preferred_device(preferences.as_ref(), Some(&PreferredDevice::new("hs-1", "Klein")))
        .await
        .unwrap();
    let mut config = test_config();
    config.auto_connect_preferred = false;
    let h = harness_with(backend, config, preferences);

    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();

    assert!(!h.store.is_scanning());
    assert_eq!(h.backend.state().connect_calls, 0);
}

#[tokio::test]
async fn test_preferred_device_last_write_wins() {
    let h = harness(FakeBackend::new());
    let device = PreferredDevice::new("hs-9", "Pryme Speaker Mic");

    let (first, second) = tokio::join!(
        h.manager.set_preferred_device(Some(device)),
        h.manager.set_preferred_device(None),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.manager.preferred_device(), None);
    assert_eq!(load_preferred_device(h.preferences.as_ref()).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_stops_scan_and_link() {
    let h = harness(FakeBackend::new());
    h.manager.initialize().await.unwrap();
    h.manager.request_permissions().await.unwrap();
    h.manager.connect_to_device("hs-1").await.unwrap();
    h.manager.start_scanning(None).await.unwrap();

    h.manager.destroy().await;

    let state = h.store.snapshot();
    assert!(!state.is_scanning);
    assert!(state.connected_device.is_none());
    assert!(h.backend.state().connected.is_empty());
}
