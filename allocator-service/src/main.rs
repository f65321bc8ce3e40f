// Copyright (C) 2026 The Allocator Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock, PoisonError, RwLock},
    time::{Duration, Instant},
};

use allocator_common::{
    AllocationRequest, AllocationResult, AllocationStatus, REQUEST_TYPE, TOKENS_ANNOTATION,
    TokenSet, routing_token,
};
use anyhow::Context;
use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const FLEET_LABEL: &str = "agones.dev/fleet";
const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const PUBSUB_BASE_URL: &str = "https://pubsub.googleapis.com/v1";
const PUBSUB_SCOPES: &[&str] = &["https://www.googleapis.com/auth/pubsub"];
const MAX_PULL_MESSAGES: usize = 16;

const ALLOCATIONS_TOTAL: &str = "allocations_total";
const ALLOCATION_DURATION: &str = "allocation_duration_seconds";
const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[async_trait]
trait ResultPublisher: Send + Sync {
    async fn publish_result(&self, result: &AllocationResult) -> anyhow::Result<()>;
}

#[async_trait]
trait GameServerApi: Send + Sync {
    async fn list_game_servers(&self, fleet: &str) -> anyhow::Result<Vec<GameServer>>;
    async fn get_game_server(&self, name: &str) -> anyhow::Result<GameServer>;
    async fn update_token_annotation(
        &self,
        gs: &GameServer,
        rendered: &str,
    ) -> anyhow::Result<()>;
    async fn create_allocation(&self, fleet: &str) -> anyhow::Result<AllocationOutcome>;
}

#[derive(Debug, Clone, Deserialize)]
struct GameServer {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: GameServerStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    resource_version: String,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameServerStatus {
    #[serde(default)]
    state: GameServerState,
    #[serde(default)]
    address: String,
    #[serde(default)]
    ports: Vec<GameServerPort>,
}

#[derive(Debug, Clone, Deserialize)]
struct GameServerPort {
    #[serde(default)]
    port: i32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
enum GameServerState {
    Scheduled,
    RequestReady,
    Ready,
    Allocated,
    Reserved,
    Shutdown,
    Unhealthy,
    #[serde(other)]
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
struct GameServerList {
    #[serde(default)]
    items: Vec<GameServer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GameServerAllocation {
    #[serde(default)]
    status: AllocationOutcome,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocationOutcome {
    #[serde(default)]
    state: AllocationState,
    #[serde(default)]
    game_server_name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    ports: Vec<GameServerPort>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
enum AllocationState {
    Allocated,
    UnAllocated,
    Contention,
    #[serde(other)]
    #[default]
    Unknown,
}

impl GameServer {
    fn token_annotation(&self) -> &str {
        self.metadata
            .annotations
            .get(TOKENS_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn tokens(&self) -> TokenSet {
        TokenSet::parse(self.token_annotation())
    }

    fn first_port(&self) -> i32 {
        self.status.ports.first().map(|p| p.port).unwrap_or_default()
    }
}

impl AllocationOutcome {
    fn first_port(&self) -> i32 {
        self.ports.first().map(|p| p.port).unwrap_or_default()
    }
}

/// The per-request decision machine. Each variant is one step of the ordered
/// allocation flow; transitions either advance to the next step or terminate
/// with a resolution.
#[derive(Debug)]
enum Step {
    LookupSelf,
    Cleanup,
    Join,
    Create,
    Imprint { target: Box<GameServer> },
}

#[derive(Debug)]
enum StepOutcome {
    Next(Step),
    Done(Resolution),
}

#[derive(Debug)]
enum Resolution {
    Granted {
        token: String,
        address: String,
        port: i32,
    },
    Denied {
        message: String,
    },
    Waitlisted {
        queue_id: String,
        position: usize,
    },
}

impl StepOutcome {
    fn denied(message: impl Into<String>) -> Self {
        Self::Done(Resolution::Denied {
            message: message.into(),
        })
    }
}

struct Controller {
    publisher: Arc<dyn ResultPublisher>,
    game_servers: Arc<dyn GameServerApi>,
    queues: Arc<QueueManager>,
    friend_queue_enabled: bool,
}

impl Controller {
    fn new(
        publisher: Arc<dyn ResultPublisher>,
        game_servers: Arc<dyn GameServerApi>,
        queues: Arc<QueueManager>,
        friend_queue_enabled: bool,
    ) -> Self {
        Self {
            publisher,
            game_servers,
            queues,
            friend_queue_enabled,
        }
    }

    /// Handle one allocation request, publishing exactly one result on every
    /// terminating branch. An error return means the result itself could not
    /// be published; the transport nacks so the bus redelivers.
    async fn handle(&self, req: &AllocationRequest) -> anyhow::Result<()> {
        let start = Instant::now();
        info!(ticket_id = %req.ticket_id, fleet = %req.fleet, "handling allocation request");

        if req.player_id.is_empty() {
            warn!(ticket_id = %req.ticket_id, "playerID is required for token generation");
            return self
                .publish_failure(req, start, "playerID is required for allocation")
                .await;
        }

        let token = routing_token(&req.player_id);
        match self.run_steps(req, &token).await {
            Resolution::Granted {
                token,
                address,
                port,
            } => self.publish_success(req, start, &token, &address, port).await,
            Resolution::Denied { message } => self.publish_failure(req, start, &message).await,
            Resolution::Waitlisted { queue_id, position } => {
                self.publish_queued(req, start, &queue_id, position).await
            }
        }
    }

    async fn run_steps(&self, req: &AllocationRequest, token: &str) -> Resolution {
        let mut step = Step::LookupSelf;
        loop {
            let outcome = match step {
                Step::LookupSelf => self.lookup_self(req, token).await,
                Step::Cleanup => self.cleanup_stale(req, token).await,
                Step::Join => self.join_friends(req, token).await,
                Step::Create => self.create_fresh(req).await,
                Step::Imprint { target } => self.imprint(*target, token).await,
            };
            match outcome {
                StepOutcome::Next(next) => step = next,
                StepOutcome::Done(resolution) => return resolution,
            }
        }
    }

    /// Idempotent retry path: a player whose token already sits on an
    /// Allocated instance gets that instance's endpoint back, with no writes.
    async fn lookup_self(&self, req: &AllocationRequest, token: &str) -> StepOutcome {
        let servers = match self.game_servers.list_game_servers(&req.fleet).await {
            Ok(servers) => servers,
            Err(error) => {
                warn!(fleet = %req.fleet, error = %error, "failed to search for existing allocation");
                return StepOutcome::denied(format!(
                    "failed to search for existing allocation: {error:#}"
                ));
            }
        };

        match servers.iter().find(|gs| gs.tokens().contains(token)) {
            Some(gs) if gs.status.state == GameServerState::Allocated => {
                info!(
                    game_server = %gs.metadata.name,
                    player_id = %req.player_id,
                    "found existing allocation, returning existing token"
                );
                StepOutcome::Done(Resolution::Granted {
                    token: token.to_string(),
                    address: gs.status.address.clone(),
                    port: gs.first_port(),
                })
            }
            _ => StepOutcome::Next(Step::Cleanup),
        }
    }

    /// Best effort: a player's token must not linger on instances it no longer
    /// plays on. Failures here never block the fresh allocation.
    async fn cleanup_stale(&self, req: &AllocationRequest, token: &str) -> StepOutcome {
        match self.game_servers.list_game_servers(&req.fleet).await {
            Ok(servers) => {
                for gs in &servers {
                    if !gs.tokens().contains(token) {
                        continue;
                    }
                    let rendered = TokenSet::remove(gs.token_annotation(), token);
                    info!(game_server = %gs.metadata.name, "removing stale routing token");
                    if let Err(error) = self
                        .game_servers
                        .update_token_annotation(gs, &rendered)
                        .await
                    {
                        warn!(
                            game_server = %gs.metadata.name,
                            error = %error,
                            "failed to remove stale token; continuing with allocation"
                        );
                    }
                }
            }
            Err(error) => {
                warn!(
                    fleet = %req.fleet,
                    error = %error,
                    "failed to list fleet for stale-token cleanup; continuing with allocation"
                );
            }
        }

        if req.join_on_ids.is_empty() {
            StepOutcome::Next(Step::Create)
        } else {
            StepOutcome::Next(Step::Join)
        }
    }

    async fn join_friends(&self, req: &AllocationRequest, token: &str) -> StepOutcome {
        info!(
            join_on_ids = ?req.join_on_ids,
            can_join_not_found = req.can_join_not_found,
            "friend join requested"
        );

        let friend_tokens: Vec<String> =
            req.join_on_ids.iter().map(|id| routing_token(id)).collect();

        let servers = match self.game_servers.list_game_servers(&req.fleet).await {
            Ok(servers) => servers,
            Err(error) => {
                warn!(fleet = %req.fleet, error = %error, "failed to search for friend gameservers");
                return StepOutcome::denied(format!("failed to search for friends: {error:#}"));
            }
        };

        let mut candidates: Vec<(&GameServer, usize)> = servers
            .iter()
            .filter_map(|gs| {
                let set = gs.tokens();
                let matched = friend_tokens.iter().filter(|t| set.contains(t)).count();
                (matched > 0).then_some((gs, matched))
            })
            .collect();

        if candidates.is_empty() {
            if !req.can_join_not_found {
                info!(ticket_id = %req.ticket_id, "friends not found and canJoinNotFound=false");
                return StepOutcome::denied("friends not found on any gameserver");
            }
            info!(
                ticket_id = %req.ticket_id,
                "friends not found but canJoinNotFound=true, proceeding with fresh allocation"
            );
            return StepOutcome::Next(Step::Create);
        }

        // Deterministic target selection: most matched friends first, then
        // instance name.
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.metadata.name.cmp(&b.0.metadata.name)));
        let (target, matched) = candidates[0];
        info!(
            game_server = %target.metadata.name,
            matched_friends = matched,
            "found friends on gameserver"
        );

        if target.status.state != GameServerState::Allocated {
            if self.friend_queue_enabled {
                return StepOutcome::Done(self.waitlist(req, &target.metadata.name));
            }
            warn!(
                game_server = %target.metadata.name,
                state = ?target.status.state,
                "friend's gameserver not in allocated state"
            );
            return StepOutcome::denied("friend's gameserver is not available");
        }

        // A ticket queued on an earlier delivery joins now that the instance
        // is available; its wait-queue entry must not outlive it.
        if self.friend_queue_enabled
            && self
                .queues
                .remove_from_queue(&target.metadata.name, &req.ticket_id)
        {
            info!(
                game_server = %target.metadata.name,
                ticket_id = %req.ticket_id,
                "removed ticket from wait-queue after gameserver became available"
            );
        }

        StepOutcome::Next(Step::Imprint {
            target: Box::new(target.clone()),
        })
    }

    fn waitlist(&self, req: &AllocationRequest, game_server: &str) -> Resolution {
        if let Some(position) = self.queues.get_position(game_server, &req.ticket_id) {
            info!(
                game_server = %game_server,
                ticket_id = %req.ticket_id,
                position,
                "ticket already waiting in queue"
            );
            return Resolution::Waitlisted {
                queue_id: game_server.to_string(),
                position,
            };
        }

        let position = self.queues.enqueue(game_server, req.clone());
        info!(
            game_server = %game_server,
            ticket_id = %req.ticket_id,
            position,
            "queued ticket for unavailable friend gameserver"
        );
        Resolution::Waitlisted {
            queue_id: game_server.to_string(),
            position,
        }
    }

    async fn create_fresh(&self, req: &AllocationRequest) -> StepOutcome {
        let outcome = match self.game_servers.create_allocation(&req.fleet).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(fleet = %req.fleet, error = %error, "GameServerAllocation create failed");
                return StepOutcome::denied(format!("allocation create failed: {error:#}"));
            }
        };

        if outcome.state != AllocationState::Allocated {
            warn!(state = ?outcome.state, fleet = %req.fleet, "allocation not allocated");
            return StepOutcome::denied(format!(
                "allocation not allocated (state={:?})",
                outcome.state
            ));
        }

        if outcome.address.is_empty() || outcome.first_port() == 0 {
            warn!(
                address = %outcome.address,
                port = outcome.first_port(),
                "allocated GameServer missing address/port"
            );
            return StepOutcome::denied("allocated GameServer missing address/port");
        }

        if outcome.game_server_name.is_empty() {
            return StepOutcome::denied("allocated GameServer name is empty in allocation response");
        }

        match self
            .game_servers
            .get_game_server(&outcome.game_server_name)
            .await
        {
            Ok(gs) => StepOutcome::Next(Step::Imprint {
                target: Box::new(gs),
            }),
            Err(error) => {
                warn!(
                    game_server = %outcome.game_server_name,
                    error = %error,
                    "failed to get allocated GameServer"
                );
                StepOutcome::denied(format!(
                    "failed to get GameServer '{}': {error:#}",
                    outcome.game_server_name
                ))
            }
        }
    }

    async fn imprint(&self, target: GameServer, token: &str) -> StepOutcome {
        let rendered = TokenSet::append(target.token_annotation(), token);
        info!(
            game_server = %target.metadata.name,
            token = %token,
            "updating GameServer with routing token"
        );

        if let Err(error) = self
            .game_servers
            .update_token_annotation(&target, &rendered)
            .await
        {
            warn!(
                game_server = %target.metadata.name,
                error = %error,
                "failed to update GameServer with token"
            );
            return StepOutcome::denied(format!(
                "failed to update GameServer with token: {error:#}"
            ));
        }

        StepOutcome::Done(Resolution::Granted {
            token: token.to_string(),
            address: target.status.address.clone(),
            port: target.first_port(),
        })
    }

    async fn publish_success(
        &self,
        req: &AllocationRequest,
        start: Instant,
        token: &str,
        address: &str,
        port: i32,
    ) -> anyhow::Result<()> {
        let status = AllocationStatus::Success;
        record_allocation(status, start.elapsed());
        let result = AllocationResult::success(&req.ticket_id, token);
        if let Err(error) = self.publisher.publish_result(&result).await {
            warn!(ticket_id = %req.ticket_id, error = %error, "failed to publish success result");
            return Err(error);
        }
        info!(
            ticket_id = %req.ticket_id,
            status = status.as_str(),
            address = %address,
            port,
            duration_ms = start.elapsed().as_millis() as u64,
            "allocation successful"
        );
        Ok(())
    }

    async fn publish_failure(
        &self,
        req: &AllocationRequest,
        start: Instant,
        message: &str,
    ) -> anyhow::Result<()> {
        record_allocation(AllocationStatus::Failure, start.elapsed());
        let result = AllocationResult::failure(&req.ticket_id, message);
        if let Err(error) = self.publisher.publish_result(&result).await {
            warn!(ticket_id = %req.ticket_id, error = %error, "failed to publish failure result");
            return Err(error);
        }
        Ok(())
    }

    async fn publish_queued(
        &self,
        req: &AllocationRequest,
        start: Instant,
        queue_id: &str,
        position: usize,
    ) -> anyhow::Result<()> {
        record_allocation(AllocationStatus::Queued, start.elapsed());
        let result = AllocationResult::queued(&req.ticket_id, queue_id, position);
        if let Err(error) = self.publisher.publish_result(&result).await {
            warn!(ticket_id = %req.ticket_id, error = %error, "failed to publish queued result");
            return Err(error);
        }
        Ok(())
    }

    /// Queues live in process memory only. On shutdown the waiting entries
    /// are dropped; redelivery of their tickets re-enters the flow after
    /// restart.
    fn discard_queued_tickets(&self) {
        for (game_server, waiting) in self.queues.snapshot_lengths() {
            info!(game_server = %game_server, waiting, "discarding wait-queue on shutdown");
            while let Some(entry) = self.queues.dequeue(&game_server) {
                let waited = Utc::now().signed_duration_since(entry.enqueued_at);
                info!(
                    ticket_id = %entry.request.ticket_id,
                    game_server = %game_server,
                    waited_secs = waited.num_seconds(),
                    "dropping queued ticket on shutdown"
                );
            }
            self.queues.clear_queue(&game_server);
        }
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    request: AllocationRequest,
    enqueued_at: DateTime<Utc>,
    position: usize,
}

/// In-memory FIFO wait-queues keyed by gameserver name. Positions are
/// 1-indexed and reassigned on every mutation so they always equal the
/// entry's rank in its queue.
#[derive(Debug, Default)]
struct QueueManager {
    queues: RwLock<HashMap<String, Vec<QueueEntry>>>,
}

impl QueueManager {
    fn new() -> Self {
        Self::default()
    }

    fn renumber(queue: &mut [QueueEntry]) {
        for (index, entry) in queue.iter_mut().enumerate() {
            entry.position = index + 1;
        }
    }

    fn enqueue(&self, game_server: &str, request: AllocationRequest) -> usize {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(game_server.to_string()).or_default();
        queue.push(QueueEntry {
            request,
            enqueued_at: Utc::now(),
            position: 0,
        });
        Self::renumber(queue);
        queue.len()
    }

    fn dequeue(&self, game_server: &str) -> Option<QueueEntry> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.get_mut(game_server)?;
        if queue.is_empty() {
            return None;
        }
        let entry = queue.remove(0);
        Self::renumber(queue);
        Some(entry)
    }

    fn get_position(&self, game_server: &str, ticket_id: &str) -> Option<usize> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues
            .get(game_server)?
            .iter()
            .find(|entry| entry.request.ticket_id == ticket_id)
            .map(|entry| entry.position)
    }

    fn remove_from_queue(&self, game_server: &str, ticket_id: &str) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queues.get_mut(game_server) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|entry| entry.request.ticket_id != ticket_id);
        if queue.len() == before {
            return false;
        }
        Self::renumber(queue);
        true
    }

    fn queue_length(&self, game_server: &str) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(game_server)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn clear_queue(&self, game_server: &str) {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(game_server);
    }

    fn snapshot_lengths(&self) -> HashMap<String, usize> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, queue)| (name.clone(), queue.len()))
            .collect()
    }
}

/// Typed facade over the Agones Kubernetes API, driven through the cluster's
/// REST endpoint with the pod's service-account identity.
struct AgonesApiClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
    namespace: String,
}

impl AgonesApiClient {
    fn from_env(namespace: &str) -> anyhow::Result<Self> {
        let base_url = match normalize_optional_string(std::env::var("ALLOCATOR_KUBE_API_URL").ok())
        {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").context(
                    "KUBERNETES_SERVICE_HOST is not set; set ALLOCATOR_KUBE_API_URL when running outside a cluster",
                )?;
                let port = env_or("KUBERNETES_SERVICE_PORT", "443");
                format!("https://{host}:{port}")
            }
        };

        let token_path = env_or("ALLOCATOR_KUBE_TOKEN_FILE", SERVICE_ACCOUNT_TOKEN_PATH);
        let bearer_token = std::fs::read_to_string(&token_path)
            .with_context(|| format!("failed to read Kubernetes bearer token from {token_path}"))?
            .trim()
            .to_string();

        let ca_path = env_or("ALLOCATOR_KUBE_CA_FILE", SERVICE_ACCOUNT_CA_PATH);
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        match std::fs::read(&ca_path) {
            Ok(pem) => {
                let certificate = reqwest::Certificate::from_pem(&pem)
                    .with_context(|| format!("invalid cluster CA certificate at {ca_path}"))?;
                builder = builder.add_root_certificate(certificate);
            }
            Err(error) => {
                warn!(
                    ca_path = %ca_path,
                    error = %error,
                    "cluster CA certificate unavailable; relying on system roots"
                );
            }
        }
        let client = builder
            .build()
            .context("failed to build Kubernetes HTTP client")?;

        Ok(Self {
            client,
            base_url,
            bearer_token,
            namespace: namespace.to_string(),
        })
    }

    fn gameservers_url(&self) -> String {
        format!(
            "{}/apis/agones.dev/v1/namespaces/{}/gameservers",
            self.base_url, self.namespace
        )
    }

    fn allocations_url(&self) -> String {
        format!(
            "{}/apis/allocation.agones.dev/v1/namespaces/{}/gameserverallocations",
            self.base_url, self.namespace
        )
    }
}

async fn response_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<response body unavailable>".to_string())
}

#[async_trait]
impl GameServerApi for AgonesApiClient {
    async fn list_game_servers(&self, fleet: &str) -> anyhow::Result<Vec<GameServer>> {
        let response = self
            .client
            .get(self.gameservers_url())
            .query(&[("labelSelector", format!("{FLEET_LABEL}={fleet}"))])
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context("failed to list GameServers")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "GameServer list returned {status}: {}",
                response_body(response).await
            );
        }

        let list: GameServerList = response
            .json()
            .await
            .context("invalid GameServer list payload")?;
        Ok(list.items)
    }

    async fn get_game_server(&self, name: &str) -> anyhow::Result<GameServer> {
        let response = self
            .client
            .get(format!("{}/{}", self.gameservers_url(), name))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .with_context(|| format!("failed to get GameServer {name}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "GameServer get returned {status}: {}",
                response_body(response).await
            );
        }

        response
            .json()
            .await
            .context("invalid GameServer payload")
    }

    async fn update_token_annotation(
        &self,
        gs: &GameServer,
        rendered: &str,
    ) -> anyhow::Result<()> {
        // Merge-patch carrying the observed resourceVersion; the API server
        // rejects the write with 409 if another writer got there first.
        let patch = json!({
            "metadata": {
                "resourceVersion": gs.metadata.resource_version,
                "annotations": { TOKENS_ANNOTATION: rendered }
            }
        });

        let response = self
            .client
            .patch(format!("{}/{}", self.gameservers_url(), gs.metadata.name))
            .bearer_auth(&self.bearer_token)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(patch.to_string())
            .send()
            .await
            .with_context(|| format!("failed to update GameServer {}", gs.metadata.name))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            anyhow::bail!(
                "GameServer '{}' update rejected: stale resource version",
                gs.metadata.name
            );
        }
        if !status.is_success() {
            anyhow::bail!(
                "GameServer update returned {status}: {}",
                response_body(response).await
            );
        }
        Ok(())
    }

    async fn create_allocation(&self, fleet: &str) -> anyhow::Result<AllocationOutcome> {
        let body = json!({
            "apiVersion": "allocation.agones.dev/v1",
            "kind": "GameServerAllocation",
            "spec": {
                "selectors": [
                    { "matchLabels": { FLEET_LABEL: fleet } }
                ]
            }
        });

        let response = self
            .client
            .post(self.allocations_url())
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await
            .context("failed to create GameServerAllocation")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "GameServerAllocation create returned {status}: {}",
                response_body(response).await
            );
        }

        let created: GameServerAllocation = response
            .json()
            .await
            .context("invalid GameServerAllocation payload")?;
        Ok(created.status)
    }
}

/// How the transport disposes of one pulled message.
#[derive(Debug)]
enum Disposition {
    Handle(AllocationRequest),
    Drop(&'static str),
    Retry(String),
}

fn classify_payload(payload: &[u8]) -> Disposition {
    let request: AllocationRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(error) => return Disposition::Retry(error.to_string()),
    };

    if !request.kind.is_empty() && request.kind != REQUEST_TYPE {
        return Disposition::Drop("foreign message type on shared topic");
    }
    if request.ticket_id.is_empty() || request.fleet.is_empty() {
        return Disposition::Drop("allocation request missing ticketId or fleet");
    }
    Disposition::Handle(request)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubSubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Clone)]
struct PubSubPublisher {
    client: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
    topic_path: String,
}

impl PubSubPublisher {
    fn new(
        client: reqwest::Client,
        token_provider: Arc<dyn TokenProvider>,
        topic_path: String,
    ) -> Self {
        Self {
            client,
            token_provider,
            topic_path,
        }
    }
}

#[async_trait]
impl ResultPublisher for PubSubPublisher {
    async fn publish_result(&self, result: &AllocationResult) -> anyhow::Result<()> {
        let data = serde_json::to_vec(result).context("failed to encode allocation result")?;
        let body = json!({ "messages": [ { "data": BASE64.encode(&data) } ] });

        let token = self
            .token_provider
            .token(PUBSUB_SCOPES)
            .await
            .context("failed to get Pub/Sub access token")?;

        let response = self
            .client
            .post(format!("{PUBSUB_BASE_URL}/{}:publish", self.topic_path))
            .bearer_auth(token.as_str())
            .json(&body)
            .send()
            .await
            .context("failed to publish allocation result")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Pub/Sub publish returned {status}: {}",
                response_body(response).await
            );
        }

        let ack: PublishResponse = response
            .json()
            .await
            .context("invalid Pub/Sub publish response")?;
        debug!(
            message_id = ack.message_ids.first().map(String::as_str).unwrap_or_default(),
            ticket_id = %result.ticket_id,
            status = result.status.as_str(),
            "published allocation result"
        );
        Ok(())
    }
}

enum PullError {
    Fatal(anyhow::Error),
    Transient(anyhow::Error),
}

#[derive(Clone)]
struct PubSubSubscriber {
    client: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
    subscription_path: String,
}

impl PubSubSubscriber {
    fn new(
        client: reqwest::Client,
        token_provider: Arc<dyn TokenProvider>,
        subscription_path: String,
    ) -> Self {
        Self {
            client,
            token_provider,
            subscription_path,
        }
    }

    /// Pull-dispatch loop. Each pulled batch is handled as parallel tasks and
    /// the next pull waits for the batch to drain, bounding the number of
    /// in-flight requests to the pull size.
    async fn run(&self, controller: Arc<Controller>) -> anyhow::Result<()> {
        info!(subscription = %self.subscription_path, "pubsub subscriber started");
        loop {
            let batch = match self.pull().await {
                Ok(batch) => batch,
                Err(PullError::Transient(error)) => {
                    warn!(error = %format!("{error:#}"), "pubsub pull failed; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(PullError::Fatal(error)) => {
                    return Err(error.context("pubsub pull failed fatally"));
                }
            };

            if batch.is_empty() {
                continue;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for message in batch {
                let subscriber = self.clone();
                let controller = controller.clone();
                handles.push(tokio::spawn(async move {
                    subscriber.dispatch(&controller, message).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    async fn pull(&self) -> Result<Vec<ReceivedMessage>, PullError> {
        let token = self
            .token_provider
            .token(PUBSUB_SCOPES)
            .await
            .map_err(|error| {
                PullError::Transient(
                    anyhow::Error::new(error).context("failed to get Pub/Sub access token"),
                )
            })?;

        let response = self
            .client
            .post(format!("{PUBSUB_BASE_URL}/{}:pull", self.subscription_path))
            .bearer_auth(token.as_str())
            .json(&json!({ "maxMessages": MAX_PULL_MESSAGES }))
            .send()
            .await
            .map_err(|error| {
                PullError::Transient(anyhow::Error::new(error).context("pubsub pull request failed"))
            })?;

        let status = response.status();
        if status.is_success() {
            let parsed: PullResponse = response.json().await.map_err(|error| {
                PullError::Transient(
                    anyhow::Error::new(error).context("invalid Pub/Sub pull response"),
                )
            })?;
            return Ok(parsed.received_messages);
        }

        let error = anyhow::anyhow!(
            "Pub/Sub pull returned {status}: {}",
            response_body(response).await
        );
        // Misconfiguration (missing subscription, bad credentials) cannot heal
        // by retrying; rate limits and server errors can.
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(PullError::Fatal(error))
        } else {
            Err(PullError::Transient(error))
        }
    }

    async fn dispatch(&self, controller: &Controller, message: ReceivedMessage) {
        let received_at = Instant::now();
        let payload = match BASE64.decode(message.message.data.as_bytes()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(
                    message_id = %message.message.message_id,
                    error = %error,
                    "message data is not valid base64; dropping"
                );
                self.acknowledge(&message.ack_id).await;
                return;
            }
        };
        debug!(
            message_id = %message.message.message_id,
            size = payload.len(),
            "received pubsub message"
        );

        match classify_payload(&payload) {
            Disposition::Handle(request) => match controller.handle(&request).await {
                Ok(()) => {
                    debug!(
                        ticket_id = %request.ticket_id,
                        latency_ms = received_at.elapsed().as_millis() as u64,
                        "handler succeeded; acking message"
                    );
                    self.acknowledge(&message.ack_id).await;
                }
                Err(error) => {
                    warn!(
                        ticket_id = %request.ticket_id,
                        error = %format!("{error:#}"),
                        "handler failed; nacking for redelivery"
                    );
                    self.reject(&message.ack_id).await;
                }
            },
            Disposition::Drop(reason) => {
                warn!(message_id = %message.message.message_id, reason = %reason, "dropping message");
                self.acknowledge(&message.ack_id).await;
            }
            Disposition::Retry(reason) => {
                warn!(
                    message_id = %message.message.message_id,
                    reason = %reason,
                    "failed to decode allocation request; nacking for retry"
                );
                self.reject(&message.ack_id).await;
            }
        }
    }

    async fn acknowledge(&self, ack_id: &str) {
        let url = format!("{PUBSUB_BASE_URL}/{}:acknowledge", self.subscription_path);
        let body = json!({ "ackIds": [ack_id] });
        if let Err(error) = self.post_ack(&url, &body).await {
            warn!(error = %format!("{error:#}"), "failed to ack pubsub message");
        }
    }

    /// Nack: an ack deadline of zero returns the message to the subscription
    /// for immediate redelivery.
    async fn reject(&self, ack_id: &str) {
        let url = format!(
            "{PUBSUB_BASE_URL}/{}:modifyAckDeadline",
            self.subscription_path
        );
        let body = json!({ "ackIds": [ack_id], "ackDeadlineSeconds": 0 });
        if let Err(error) = self.post_ack(&url, &body).await {
            warn!(error = %format!("{error:#}"), "failed to nack pubsub message");
        }
    }

    async fn post_ack(&self, url: &str, body: &serde_json::Value) -> anyhow::Result<()> {
        let token = self
            .token_provider
            .token(PUBSUB_SCOPES)
            .await
            .context("failed to get Pub/Sub access token")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token.as_str())
            .json(body)
            .send()
            .await
            .context("pubsub ack request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Pub/Sub returned {status}: {}", response_body(response).await);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Config {
    google_project_id: String,
    subscription: String,
    result_topic: String,
    target_namespace: String,
    metrics_port: u16,
    log_level: String,
    credentials_file: Option<String>,
    friend_queue_enabled: bool,
}

impl Config {
    fn load() -> Self {
        let credentials_file =
            normalize_optional_string(std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok())
                .or_else(|| {
                    normalize_optional_string(std::env::var("ALLOCATOR_GSA_CREDENTIALS").ok())
                });

        let mut cfg = Self {
            google_project_id: String::new(),
            subscription: env_or_alias(
                "ALLOCATION_REQUEST_SUBSCRIPTION",
                "ALLOCATOR_PUBSUB_SUBSCRIPTION",
            ),
            result_topic: env_or_alias("ALLOCATION_RESULT_TOPIC", "ALLOCATOR_PUBSUB_TOPIC"),
            target_namespace: env_or("TARGET_NAMESPACE", "default"),
            metrics_port: env_u16("ALLOCATOR_METRICS_PORT", 8080),
            log_level: env_or("ALLOCATOR_LOG_LEVEL", "info"),
            credentials_file,
            friend_queue_enabled: parse_env_bool("ALLOCATOR_FRIEND_QUEUE", false),
        };
        cfg.google_project_id = resolve_google_project_id(cfg.credentials_file.as_deref());

        if cfg.google_project_id.is_empty() {
            warn!(
                "Google project ID not resolved; set GOOGLE_APPLICATION_CREDENTIALS or GOOGLE_PROJECT_ID or ALLOCATOR_PUBSUB_PROJECT_ID"
            );
        }
        if cfg.subscription.is_empty() {
            warn!(
                "Pub/Sub subscription not set; set ALLOCATION_REQUEST_SUBSCRIPTION or ALLOCATOR_PUBSUB_SUBSCRIPTION"
            );
        }
        if cfg.result_topic.is_empty() {
            warn!("Pub/Sub topic not set; set ALLOCATION_RESULT_TOPIC or ALLOCATOR_PUBSUB_TOPIC");
        }
        cfg
    }

    fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }

    fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.google_project_id, self.subscription
        )
    }

    fn topic_path(&self) -> String {
        format!("projects/{}/topics/{}", self.google_project_id, self.result_topic)
    }

    /// Log-safe view: names and flags only, never credential contents.
    fn log_redacted(&self) {
        info!(
            project_id = %self.google_project_id,
            request_subscription = %self.subscription,
            result_topic = %self.result_topic,
            target_namespace = %self.target_namespace,
            metrics_port = self.metrics_port,
            log_level = %self.log_level,
            credentials_provided = self.credentials_file.is_some(),
            friend_queue_enabled = self.friend_queue_enabled,
            "config loaded"
        );
    }
}

fn resolve_google_project_id(fallback_credentials: Option<&str>) -> String {
    if let Some(path) =
        normalize_optional_string(std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok())
    {
        info!(creds_file = %path, "extracting project_id from GOOGLE_APPLICATION_CREDENTIALS");
        if let Some(project_id) = project_id_from_credentials(&path) {
            return project_id;
        }
        warn!(creds_file = %path, "project_id not found in credentials file or unreadable");
    }

    if let Some(explicit) = normalize_optional_string(std::env::var("ALLOCATOR_PUBSUB_PROJECT_ID").ok())
    {
        return explicit;
    }

    if let Some(project_id) = normalize_optional_string(std::env::var("GOOGLE_PROJECT_ID").ok()) {
        return project_id;
    }

    for key in ["GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT", "GCP_PROJECT"] {
        if let Some(project_id) = normalize_optional_string(std::env::var(key).ok()) {
            return project_id;
        }
    }

    if let Some(path) = fallback_credentials {
        if let Some(project_id) = project_id_from_credentials(path) {
            info!(creds_file = %path, "using project_id from provided credentials file");
            return project_id;
        }
    }

    String::new()
}

fn project_id_from_credentials(path: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Credentials {
        #[serde(default)]
        project_id: String,
    }

    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Credentials = serde_json::from_str(&raw).ok()?;
    normalize_optional_string(Some(parsed.project_id))
}

fn env_or(key: &str, default: &str) -> String {
    normalize_optional_string(std::env::var(key).ok()).unwrap_or_else(|| default.to_string())
}

fn env_or_alias(key: &str, alias: &str) -> String {
    normalize_optional_string(std::env::var(key).ok())
        .or_else(|| normalize_optional_string(std::env::var(alias).ok()))
        .unwrap_or_default()
}

fn env_u16(key: &str, default: u16) -> u16 {
    match normalize_optional_string(std::env::var(key).ok()) {
        Some(value) => match value.parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key = %key, value = %value, "invalid integer in environment; using default");
                default
            }
        },
        None => default,
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            if normalized.is_empty() {
                default
            } else {
                !matches!(normalized.as_str(), "0" | "false" | "no" | "off")
            }
        })
        .unwrap_or(default)
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder. Safe to call more than once; the
/// process should not run without metrics, so installation failure panics.
fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets(DEFAULT_LATENCY_BUCKETS)
                .unwrap_or_else(|error| panic!("invalid metrics buckets: {error}"))
                .install_recorder()
                .unwrap_or_else(|error| panic!("failed to install prometheus recorder: {error}"));
            describe_counter!(ALLOCATIONS_TOTAL, "Total allocation attempts");
            describe_histogram!(
                ALLOCATION_DURATION,
                "Duration of allocation processing in seconds"
            );
            handle
        })
        .clone()
}

fn record_allocation(status: AllocationStatus, duration: Duration) {
    histogram!(ALLOCATION_DURATION).record(duration.as_secs_f64());
    counter!(ALLOCATIONS_TOTAL, "result" => status.as_str()).increment(1);
}

async fn serve_metrics() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz() -> &'static str {
    "ready"
}

async fn queue_lengths(State(queues): State<Arc<QueueManager>>) -> Json<HashMap<String, usize>> {
    Json(queues.snapshot_lengths())
}

fn build_router(queues: Arc<QueueManager>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/queues", get(queue_lengths))
        .with_state(queues)
        .layer(TraceLayer::new_for_http())
}

fn init_tracing() {
    let filter = if let Ok(custom) = std::env::var("RUST_LOG") {
        custom
    } else if std::env::var("DEBUG").is_ok_and(|value| !value.is_empty()) {
        "allocator_service=debug,allocator_common=debug".to_string()
    } else {
        let level = env_or("ALLOCATOR_LOG_LEVEL", "info");
        format!("allocator_service={level},allocator_common={level},tower_http=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_token_provider(cfg: &Config) -> anyhow::Result<Arc<dyn TokenProvider>> {
    if let Some(path) = &cfg.credentials_file {
        info!(creds_file = %path, "using explicit Google credentials file");
        let account = gcp_auth::CustomServiceAccount::from_file(path)
            .context("failed to load Google credentials file")?;
        Ok(Arc::new(account))
    } else {
        info!("using default Google credentials (in-cluster or ambient)");
        gcp_auth::provider()
            .await
            .context("failed to initialize Google credentials provider")
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "starting allocator-service");

    let cfg = Config::load();
    cfg.log_redacted();

    if cfg.google_project_id.is_empty() {
        anyhow::bail!(
            "missing Google project id; set GOOGLE_APPLICATION_CREDENTIALS or GOOGLE_PROJECT_ID or ALLOCATOR_PUBSUB_PROJECT_ID"
        );
    }
    if cfg.subscription.is_empty() {
        anyhow::bail!(
            "missing Pub/Sub subscription; set ALLOCATION_REQUEST_SUBSCRIPTION or ALLOCATOR_PUBSUB_SUBSCRIPTION"
        );
    }
    if cfg.result_topic.is_empty() {
        anyhow::bail!("missing Pub/Sub topic; set ALLOCATION_RESULT_TOPIC or ALLOCATOR_PUBSUB_TOPIC");
    }

    init_metrics();

    let queues = Arc::new(QueueManager::new());
    let app = build_router(queues.clone());
    let listener = tokio::net::TcpListener::bind(cfg.http_addr())
        .await
        .with_context(|| format!("failed to bind metrics server on {}", cfg.http_addr()))?;
    info!(addr = %cfg.http_addr(), "metrics/health server listening");
    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            warn!(error = %error, "metrics server stopped");
        }
    });

    let token_provider = build_token_provider(&cfg).await?;
    let pubsub_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()
        .context("failed to build Pub/Sub HTTP client")?;

    let publisher: Arc<dyn ResultPublisher> = Arc::new(PubSubPublisher::new(
        pubsub_client.clone(),
        token_provider.clone(),
        cfg.topic_path(),
    ));
    let game_servers: Arc<dyn GameServerApi> =
        Arc::new(AgonesApiClient::from_env(&cfg.target_namespace)?);
    let controller = Arc::new(Controller::new(
        publisher,
        game_servers,
        queues,
        cfg.friend_queue_enabled,
    ));
    let subscriber = PubSubSubscriber::new(pubsub_client, token_provider, cfg.subscription_path());

    tokio::select! {
        result = subscriber.run(controller.clone()) => {
            server.abort();
            result.context("subscriber exited with fatal error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            controller.discard_queued_tickets();
            server.abort();
        }
    }

    info!("shutdown complete");
    Ok(())
}
