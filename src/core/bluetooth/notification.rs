//! Notification handling for PTT accessories
//! All button characteristic subscriptions feed one channel, so frames
//! from a device are decoded and applied strictly in arrival order.

use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::protocol::decode_notification;
use crate::core::bluetooth::store::ConnectionStore;
use crate::core::bluetooth::types::{ButtonEvent, Notification};
use crate::core::routing::AudioRoutingBridge;
use crate::core::rt;

/// Notification handler for button frames
#[derive(Clone)]
pub struct NotificationHandler {
    store: ConnectionStore,
    bridge: AudioRoutingBridge,
}

impl NotificationHandler {
    pub fn new(store: ConnectionStore, bridge: AudioRoutingBridge) -> Self {
        Self { store, bridge }
    }

    /// Starts draining `notifications` in the background until `cancel` fires.
    pub fn start(&self, notifications: mpsc::UnboundedReceiver<Notification>, cancel: CancellationToken) {
        let handler = self.clone();
        rt::spawn(async move {
            handler.process_notifications(notifications, cancel).await;
        });
    }

    /// Process notifications from the device
    pub async fn process_notifications(
        &self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        cancel: CancellationToken,
    ) {
        info!("Listening for button notifications...");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(notification) => {
                        self.handle_notification(&notification).await;
                    }
                    None => break,
                },
            }
        }
        info!("Notification stream ended");
    }

    /// Decodes one frame, records it and applies it to the call.
    pub async fn handle_notification(&self, notification: &Notification) -> Option<ButtonEvent> {
        debug!(
            "Received data on {}: {:02X?}",
            notification.characteristic, notification.value
        );
        let event = decode_notification(
            notification.service,
            notification.characteristic,
            &notification.value,
        )?;

        debug!("Decoded button event: {:?}", event);
        self.store.push_button_event(event.clone());
        self.bridge.handle_button(&event).await;
        Some(event)
    }
}
