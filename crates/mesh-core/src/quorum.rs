//! Quorum: cluster-wide control plane over one
//! dedicated pub/sub channel per app — activation, throttle, rollcall, and
//! one-time job-result delivery all ride this channel.

use crate::error::{MeshError, MeshResult};
use crate::store::Store;
use crate::stream::Stream as MeshStream;
use crate::sub::Sub;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Quorum message envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QuorumMessage {
    Ping { originator: String },
    Pong { originator: String, profile: Option<QuorumProfile> },
    Activate {
        cache_mode: CacheModeWire,
        until_version: String,
    },
    Throttle {
        topic: Option<String>,
        guid: Option<String>,
        throttle: i64,
    },
    Work { guid: String },
    Job { guid: String, job: Json },
    Cron { guid: String },
    Rollcall { originator: String, details: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheModeWire {
    Cache,
    Nocache,
}

/// An engine's self-report, attached to a `pong`: each engine replies with a
/// pong carrying an optional `QuorumProfile`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuorumProfile {
    pub engine_id: String,
    pub stream: String,
    pub counts: BTreeMap<String, u64>,
    pub timestamp: i64,
    pub throttle: i64,
    pub reclaim_delay_ms: u64,
    pub reclaim_count: u32,
    pub system_health: String,
    pub worker_topic: Option<String>,
}

/// Supplies the live profile fields a `pong` reports; implemented by
/// `Engine`/`Router` so `Quorum` never depends on them directly.
pub trait ProfileSource: Send + Sync {
    fn profile(&self) -> QuorumProfile;
}

struct QuorumState {
    pong_count: AtomicU64,
    last_request_baseline: AtomicU64,
    rollcall_streams: RwLock<Vec<(String, String)>>,
}

pub struct Quorum {
    app_id: String,
    engine_guid: String,
    sub: Arc<dyn Sub>,
    store: Arc<dyn Store>,
    profile_source: Arc<dyn ProfileSource>,
    state: Arc<QuorumState>,
}

impl Quorum {
    pub fn new(
        app_id: impl Into<String>,
        engine_guid: impl Into<String>,
        sub: Arc<dyn Sub>,
        store: Arc<dyn Store>,
        profile_source: Arc<dyn ProfileSource>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            engine_guid: engine_guid.into(),
            sub,
            store,
            profile_source,
            state: Arc::new(QuorumState {
                pong_count: AtomicU64::new(0),
                last_request_baseline: AtomicU64::new(0),
                rollcall_streams: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to the quorum channel; replies to `ping`/`rollcall` with a
    /// `pong`, and counts incoming `pong`s for `request_quorum`. Call once
    /// per engine instance at startup.
    pub async fn start(&self) -> MeshResult<()> {
        let app_id = self.app_id.clone();
        let guid = self.engine_guid.clone();
        let sub = self.sub.clone();
        let state = self.state.clone();
        let profile_source = self.profile_source.clone();

        self.sub
            .subscribe(
                "quorum",
                &self.app_id,
                None,
                Arc::new(move |payload: Json| {
                    let Ok(msg) = serde_json::from_value::<QuorumMessage>(payload) else {
                        return;
                    };
                    match msg {
                        QuorumMessage::Ping { originator } if originator != guid => {
                            let pong = QuorumMessage::Pong {
                                originator: guid.clone(),
                                profile: Some(profile_source.profile()),
                            };
                            let sub = sub.clone();
                            let app_id = app_id.clone();
                            tokio::spawn(async move {
                                let _ = sub
                                    .publish("quorum", &serde_json::to_value(&pong).unwrap_or(Json::Null), &app_id, None)
                                    .await;
                            });
                        }
                        QuorumMessage::Pong { .. } => {
                            state.pong_count.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// `requestQuorum(delay, details?) -> count`: publish `ping`, wait
    /// `delay`, return the number of `pong`s received since the previous
    /// call.
    pub async fn request_quorum(&self, delay: Duration, details: bool) -> MeshResult<u64> {
        let baseline = self.state.pong_count.load(Ordering::SeqCst);
        self.state.last_request_baseline.store(baseline, Ordering::SeqCst);
        let ping = QuorumMessage::Ping { originator: self.engine_guid.clone() };
        self.publish(&ping).await?;
        let _ = details;
        tokio::time::sleep(delay).await;
        let now = self.state.pong_count.load(Ordering::SeqCst);
        Ok(now.saturating_sub(baseline))
    }

    /// `rollCall(delay)`: `requestQuorum(..., true)` then `XLEN` every
    /// unique stream registered via `register_stream_for_rollcall`,
    /// annotating `stream_depth`.
    pub async fn roll_call(&self, delay: Duration, stream: &dyn MeshStream) -> MeshResult<RollCallReport> {
        let count = self.request_quorum(delay, true).await?;
        let streams = self.state.rollcall_streams.read().await.clone();
        let mut depths = BTreeMap::new();
        for (label, key) in streams {
            let depth = stream.xlen(&key).await.unwrap_or(0);
            depths.insert(label, depth);
        }
        Ok(RollCallReport { responding: count, stream_depth: depths })
    }

    pub async fn register_stream_for_rollcall(&self, label: impl Into<String>, key: impl Into<String>) {
        self.state.rollcall_streams.write().await.push((label.into(), key.into()));
    }

    /// `{type:'throttle', topic?, guid?, throttle}`: publish globally, for a
    /// single topic, or for a single engine's guid.
    pub async fn set_throttle(&self, topic: Option<String>, guid: Option<String>, throttle_ms: i64) -> MeshResult<()> {
        self.publish(&QuorumMessage::Throttle { topic, guid, throttle: throttle_ms }).await
    }

    /// Activation protocol.
    /// Steps 1-6: reserve scout role, require three identical nonzero quorum
    /// counts, publish `activate`, wait for local observation of
    /// `until_version`, then `activate_app_version`. On mismatch, retry with
    /// doubled delay up to `max_retry`.
    pub async fn activate(
        &self,
        version: &str,
        mut delay: Duration,
        max_retry: u32,
        observed_version: impl Fn() -> Option<String>,
    ) -> MeshResult<()> {
        let won = self.store.reserve_scout_role("activate", 30).await?;
        if !won {
            // A peer is already running activation; poll until the app
            // record reflects the target version.
            for _ in 0..max_retry {
                tokio::time::sleep(delay).await;
                if let Some(app) = self.store.get_app(&self.app_id).await? {
                    if app.active && app.version == version {
                        return Ok(());
                    }
                }
            }
            return Err(MeshError::ActivationError {
                app_id: self.app_id.clone(),
                version: version.to_string(),
                attempts: max_retry,
            });
        }

        for attempt in 0..max_retry {
            let q1 = self.request_quorum(delay, false).await?;
            let q2 = self.request_quorum(delay, false).await?;
            let q3 = self.request_quorum(delay, false).await?;
            if q1 != 0 && q1 == q2 && q2 == q3 {
                self.publish(&QuorumMessage::Activate {
                    cache_mode: CacheModeWire::Nocache,
                    until_version: version.to_string(),
                })
                .await?;
                tokio::time::sleep(delay).await;
                if observed_version().as_deref() == Some(version) {
                    self.store.activate_app_version(&self.app_id, version).await?;
                    return Ok(());
                }
            }
            tracing::warn!(attempt, q1, q2, q3, "activation quorum mismatch, retrying");
            delay *= 2;
        }
        Err(MeshError::ActivationError {
            app_id: self.app_id.clone(),
            version: version.to_string(),
            attempts: max_retry,
        })
    }

    async fn publish(&self, msg: &QuorumMessage) -> MeshResult<()> {
        let payload = serde_json::to_value(msg)
            .map_err(|e| MeshError::ValidationError(format!("quorum message encode: {e}")))?;
        self.sub.publish("quorum", &payload, &self.app_id, None).await
    }
}

#[derive(Clone, Debug, Default)]
pub struct RollCallReport {
    pub responding: u64,
    pub stream_depth: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_message_round_trips_through_json() {
        let msg = QuorumMessage::Activate {
            cache_mode: CacheModeWire::Nocache,
            until_version: "2".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        let back: QuorumMessage = serde_json::from_value(json).unwrap();
        match back {
            QuorumMessage::Activate { until_version, .. } => assert_eq!(until_version, "2"),
            _ => panic!("expected Activate"),
        }
    }
}
