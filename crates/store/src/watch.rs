use tokio::sync::mpsc;

/// A single change observed on a watched prefix.
///
/// Watches start with a synthetic `Put` for every live row under the prefix,
/// then deliver real-time events in commit order. Delivery is at-least-once;
/// consumers must apply events idempotently.
#[derive(Debug, Clone)]
pub enum Event {
    Put {
        key: String,
        value: Vec<u8>,
        revision: u64,
    },
    Delete {
        key: String,
        revision: u64,
    },
    Error {
        message: String,
    },
}

impl Event {
    pub fn key(&self) -> Option<&str> {
        match self {
            Event::Put { key, .. } | Event::Delete { key, .. } => Some(key),
            Event::Error { .. } => None,
        }
    }
}

/// Receiving half of a watch. Keys are delivered relative to the watched
/// prefix. `recv` returns `None` once the store side of the watch is gone;
/// consumers treat that the same way as an `Error` event and re-establish
/// the watch with backoff.
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<Event>,
    strip: String,
    filter: Option<Box<dyn Fn(&Event) -> bool + Send>>,
}

impl Watcher {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Event>, prefix: &str) -> Self {
        Watcher {
            rx,
            strip: format!("{}/", prefix),
            filter: None,
        }
    }

    pub(crate) fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let mut event = self.rx.recv().await?;
            match &mut event {
                Event::Put { key, .. } | Event::Delete { key, .. } => {
                    if let Some(rest) = key.strip_prefix(&self.strip) {
                        *key = rest.to_string();
                    }
                }
                Event::Error { .. } => {}
            }
            if let Some(filter) = &self.filter {
                if !filter(&event) {
                    continue;
                }
            }
            return Some(event);
        }
    }
}
