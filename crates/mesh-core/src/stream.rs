//! Stream: append/ack/claim/xlen over
//! consumer-grouped streams.

use crate::error::MeshResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Timehook,
    Webhook,
    Transition,
    Await,
    Result,
    /// The worker-response default: anything not named above.
    Worker,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Success,
    Pending,
    Error,
}

/// Stream message envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub code: Option<i32>,
    pub metadata: StreamMetadata,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub guid: String,
    pub jid: String,
    pub gid: String,
    pub dad: String,
    pub aid: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub trc: Option<String>,
    #[serde(default)]
    pub spn: Option<String>,
    #[serde(default)]
    pub pj: Option<String>,
    #[serde(default)]
    pub pg: Option<String>,
    #[serde(default)]
    pub pd: Option<String>,
    #[serde(default)]
    pub pa: Option<String>,
    #[serde(default)]
    pub px: Option<bool>,
    /// One-time quorum-subscriber guid, carried through from `pubsub` so the
    /// triggered job can stamp it and `runJobCompletionTasks` can notify the
    /// waiting caller once on completion.
    #[serde(default)]
    pub ngn: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
}

/// Contract. `consumeMessages` is modeled as a poll-one
/// operation (`read_one`) rather than a blocking loop so the caller (Router)
/// owns the cooperative scheduling loop, backoff, and throttle.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn create_consumer_group(&self, stream: &str, group: &str) -> MeshResult<()>;
    async fn publish_message(&self, stream: &str, data: &StreamMessage) -> MeshResult<String>;
    /// Read up to one message for `consumer` in `group`. `None` means the
    /// stream had nothing pending — the caller backs off.
    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> MeshResult<Option<(String, StreamMessage)>>;
    /// Acknowledge successful processing; `delete` additionally trims the
    /// entry from the stream (policy choice per call site).
    async fn ack(&self, stream: &str, group: &str, id: &str, delete: bool) -> MeshResult<()>;
    async fn pending(&self, stream: &str, group: &str) -> MeshResult<Vec<PendingMessage>>;
    /// Reclaim messages idle longer than `min_idle_ms`, returning the ids
    /// claimed by `consumer`.
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> MeshResult<Vec<String>>;
    async fn xlen(&self, stream: &str) -> MeshResult<u64>;
}
