//! In-process discovery source.

use std::sync::Mutex;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::{DiscoveryEvent, DiscoverySource};

const CHANNEL_CAPACITY: usize = 256;

/// Discovery source fed by an mpsc channel.
///
/// Used for embedding and tests. Only the first subscription receives
/// events; later subscriptions end immediately.
pub struct ChannelSource {
    receiver: Mutex<Option<mpsc::Receiver<DiscoveryEvent>>>,
}

impl ChannelSource {
    pub fn new() -> (Self, mpsc::Sender<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                receiver: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl DiscoverySource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match receiver {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                let event = rx.recv().await?;
                Some((event, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }
}
