//! Message router: notification bytes in, machine events out

use std::sync::Arc;

use bleota_proto::FrameCodec;
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::GATT_CONN_TERMINATE_PEER_USER;
use crate::gatt::{ConnectionEvent, NotificationStream};
use crate::machine::Event;

/// Decode one notification; decode failures are forwarded, never dropped
pub fn route(codec: &dyn FrameCodec, data: &[u8]) -> Event {
    let decoded = codec.decode(data);
    if let Err(e) = &decoded {
        warn!("unparseable notification {data:02x?}: {e}");
    }
    Event::Notification(decoded)
}

/// Forward every notification into the session queue until the link drops
pub async fn run(
    mut notifications: NotificationStream,
    codec: Arc<dyn FrameCodec>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(data) = notifications.next().await {
        if events.send(route(codec.as_ref(), &data)).is_err() {
            return;
        }
    }

    debug!("notification stream ended");
    let _ = events.send(Event::Connection(ConnectionEvent::Disconnected {
        status: GATT_CONN_TERMINATE_PEER_USER,
    }));
}
