use super::{
    CoordinationStore, KeyValueEntry, Snapshot, WatchEvent, WatchEventKind, WatchMessage,
    WatchSubscription,
};
use crate::{Result, SilverError};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, WatchOptions};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct EtcdCoordinationStore {
    client: Client,
}

impl EtcdCoordinationStore {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|error| {
                SilverError::Connection(format!(
                    "failed to connect to etcd {:?}: {}",
                    endpoints, error
                ))
            })?;

        tracing::info!("Connected to etcd endpoints {:?}", endpoints);
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdCoordinationStore {
    async fn snapshot(&self, prefix: &str) -> Result<Snapshot> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = response
            .header()
            .map(|header| header.revision())
            .unwrap_or_default();

        let entries = response
            .kvs()
            .iter()
            .filter_map(|kv| decode_entry(kv.key(), kv.value()))
            .collect();

        Ok(Snapshot { revision, entries })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchSubscription> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }

        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();

        let pump = tokio::spawn(async move {
            // Dropping the watcher together with the stream closes the gRPC watch.
            let _watcher = watcher;
            loop {
                let response = match stream.message().await {
                    Ok(Some(response)) => response,
                    Ok(None) => break,
                    Err(error) => {
                        let _ = sender.send(Err(SilverError::from(error)));
                        break;
                    }
                };

                if response.compact_revision() > 0 {
                    let _ = sender.send(Ok(WatchMessage::Compacted {
                        compact_revision: response.compact_revision(),
                    }));
                    break;
                }

                if response.canceled() {
                    let _ = sender.send(Err(SilverError::Connection(format!(
                        "watch on {} canceled: {}",
                        prefix,
                        response.cancel_reason()
                    ))));
                    break;
                }

                let events: Vec<WatchEvent> = response
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kv = event.kv()?;
                        let kind = match event.event_type() {
                            EventType::Put => WatchEventKind::Put,
                            EventType::Delete => WatchEventKind::Delete,
                        };
                        let entry = decode_entry(kv.key(), kv.value())?;
                        Some(WatchEvent {
                            kind,
                            key: entry.key,
                            value: entry.value,
                            revision: kv.mod_revision(),
                        })
                    })
                    .collect();

                if events.is_empty() {
                    continue;
                }

                if sender.send(Ok(WatchMessage::Events(events))).is_err() {
                    break;
                }
            }
            tracing::debug!("etcd watch pump for {} exited", prefix);
        });

        Ok(WatchSubscription::with_pump(receiver, pump))
    }
}

/// Keys and values outside UTF-8 cannot name a table or an address; they are
/// skipped so one foreign key under the prefix does not fail the caller.
fn decode_entry(key: &[u8], value: &[u8]) -> Option<KeyValueEntry> {
    let Ok(key) = std::str::from_utf8(key) else {
        tracing::warn!(
            "Skipping non UTF-8 key {:?}",
            String::from_utf8_lossy(key)
        );
        return None;
    };
    let Ok(value) = std::str::from_utf8(value) else {
        tracing::warn!("Skipping key {} with non UTF-8 value", key);
        return None;
    };
    Some(KeyValueEntry {
        key: key.to_string(),
        value: value.to_string(),
    })
}
