//! Daemon Server Implementation
//!
//! This module provides the server loop for the relay daemon:
//! - Accepts WebSocket connections on a TCP listener
//! - Registers every connection with the pipeline's broadcaster, so it
//!   receives every stream message
//! - Reads JSON commands from each connection and answers on that
//!   connection only
//! - Closes connections that stay silent longer than the read timeout
//!
//! # Command Frames
//!
//! ```text
//! -> {"id": 1, "method": "create_conversation_message", "params": {...}}
//! <- {"id": 1, "result": {...}}           (or {"id": 1, "error": {...}})
//! <- {"channel_id": "c/i", "type": "message_fragment", ...}
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::{
    Actor, Connection, ConnectionError, CreateConversationMessageRequest,
    CreateConversationRequest, InteractionPipeline, RelayError, RequestContext, ServiceInfo,
    StructuredError,
};

/// Error code for a frame that is not a command
const INVALID_REQUEST: &str = "invalid_request";
/// Error code for params that do not match the method
const INVALID_PARAMS: &str = "invalid_params";
/// Error code for an unknown method
const UNKNOWN_METHOD: &str = "unknown_method";

/// Per-connection settings
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// Close a connection after this long without a frame
    pub read_timeout: Duration,
    /// Service identity stamped on every request context
    pub service: ServiceInfo,
}

/// The WebSocket server
pub struct RelayServer {
    listener: TcpListener,
    pipeline: InteractionPipeline,
    settings: ServerSettings,
}

impl RelayServer {
    /// Bind the listener
    pub async fn bind(
        addr: &str,
        pipeline: InteractionPipeline,
        settings: ServerSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;
        info!(addr = %listener.local_addr()?, "Listening for WebSocket connections");

        Ok(Self {
            listener,
            pipeline,
            settings,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            tokio::spawn(
                handle_connection(stream, self.pipeline.clone(), self.settings.clone())
                    .instrument(tracing::info_span!("connection", %peer)),
            );
        }
    }
}

/// Outbound half of a WebSocket, driven by the broadcaster's writer task
struct WsConnection {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn write_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| ConnectionError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    pipeline: InteractionPipeline,
    settings: ServerSettings,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (sink, mut source) = ws.split();
    let broadcaster = pipeline.broadcaster();
    let connection_id = broadcaster.register(WsConnection { sink });
    debug!(
        connection_id = %connection_id,
        active_connections = broadcaster.count(),
        "WebSocket handshake complete"
    );

    loop {
        let frame = match tokio::time::timeout(settings.read_timeout, source.next()).await {
            Err(_) => {
                info!(connection_id = %connection_id, "Connection idle, closing");
                break;
            }
            Ok(None) => {
                info!(connection_id = %connection_id, "Client disconnected");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(connection_id = %connection_id, error = %e, "Read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let reply = dispatch(&pipeline, &settings.service, &text).await;
                if broadcaster.send_to(&connection_id, reply).await.is_err() {
                    // Already pruned by the broadcaster
                    return;
                }
            }
            Message::Close(_) => {
                debug!(connection_id = %connection_id, "Close frame received");
                break;
            }
            Message::Binary(_) => {
                warn!(connection_id = %connection_id, "Ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    broadcaster.unregister(&connection_id);
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Deserialize)]
struct Command {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Reply {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StructuredError>,
}

#[derive(Debug, Deserialize)]
struct ExcludedStateParams {
    owner: Actor,
    interaction_id: String,
    excluded: bool,
}

#[derive(Debug, Deserialize)]
struct InteractionParams {
    interaction_id: String,
}

#[derive(Debug, Deserialize)]
struct ConversationParams {
    owner: Actor,
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct OwnerParams {
    owner: Actor,
}

#[derive(Debug, Deserialize)]
struct DeleteConversationsParams {
    owner: Actor,
    conversation_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteInteractionsParams {
    owner: Actor,
    interaction_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: usize,
}

/// Run one command frame and encode the reply
pub async fn dispatch(pipeline: &InteractionPipeline, service: &ServiceInfo, text: &str) -> String {
    let reply = match serde_json::from_str::<Command>(text) {
        Ok(command) => {
            let ctx = RequestContext::new(service.clone());
            let span = tracing::info_span!(
                "command",
                method = %command.method,
                request_id = %ctx.request_id,
                trace_id = %ctx.trace_id,
            );
            let outcome = execute(pipeline, &ctx, &command.method, command.params)
                .instrument(span)
                .await;
            match outcome {
                Ok(result) => Reply {
                    id: command.id,
                    result: Some(result),
                    error: None,
                },
                Err(error) => Reply {
                    id: command.id,
                    result: None,
                    error: Some(error),
                },
            }
        }
        Err(e) => Reply {
            id: Value::Null,
            result: None,
            error: Some(StructuredError::new(INVALID_REQUEST).with_meta("message", e.to_string())),
        },
    };

    serde_json::to_string(&reply).unwrap_or_else(|e| {
        error!(error = %e, "Failed to encode reply");
        String::from(r#"{"id":null,"error":{"code":"unknown"}}"#)
    })
}

async fn execute(
    pipeline: &InteractionPipeline,
    ctx: &RequestContext,
    method: &str,
    params: Value,
) -> Result<Value, StructuredError> {
    match method {
        "create_conversation" => {
            let req: CreateConversationRequest = parse_params(params)?;
            respond(pipeline.create_conversation(req).await)
        }
        "create_conversation_message" => {
            let req: CreateConversationMessageRequest = parse_params(params)?;
            respond(pipeline.create_conversation_message(ctx, req).await)
        }
        "list_supported_models" => respond(pipeline.list_supported_models().await),
        "update_interaction_excluded_state" => {
            let p: ExcludedStateParams = parse_params(params)?;
            respond(
                pipeline
                    .update_interaction_excluded_state(&p.owner, &p.interaction_id, p.excluded)
                    .await,
            )
        }
        "get_interaction" => {
            let p: InteractionParams = parse_params(params)?;
            respond(pipeline.get_interaction(&p.interaction_id).await)
        }
        "get_conversation_with_interactions" => {
            let p: ConversationParams = parse_params(params)?;
            respond(
                pipeline
                    .get_conversation_with_interactions(&p.owner, &p.conversation_id)
                    .await,
            )
        }
        "list_conversations_with_interactions" => {
            let p: OwnerParams = parse_params(params)?;
            respond(pipeline.list_conversations_with_interactions(&p.owner).await)
        }
        "delete_conversations" => {
            let p: DeleteConversationsParams = parse_params(params)?;
            let result = pipeline
                .delete_conversations(&p.owner, &p.conversation_ids)
                .await;
            respond(result.map(|deleted| Deleted { deleted }))
        }
        "delete_interactions" => {
            let p: DeleteInteractionsParams = parse_params(params)?;
            let result = pipeline
                .delete_interactions(&p.owner, &p.interaction_ids)
                .await;
            respond(result.map(|deleted| Deleted { deleted }))
        }
        other => Err(StructuredError::new(UNKNOWN_METHOD).with_meta("method", other)),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, StructuredError> {
    serde_json::from_value(params)
        .map_err(|e| StructuredError::new(INVALID_PARAMS).with_meta("message", e.to_string()))
}

fn respond<T: Serialize>(result: Result<T, RelayError>) -> Result<Value, StructuredError> {
    let value = result.map_err(|e| {
        let structured = e.to_structured();
        if structured.is_server_side() {
            error!(error = %e, "Command failed");
        } else {
            debug!(code = %structured.code, "Command rejected");
        }
        structured
    })?;
    serde_json::to_value(value).map_err(|e| StructuredError::unknown(e.to_string()))
}
