use std::error::Error;
use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use workspace_stream_sdk::auth::MemoryCredentialStore;
use workspace_stream_sdk::retry::RetryPolicy;
use workspace_stream_sdk::stream::client::StreamClient;
use workspace_stream_sdk::stream::proto::{
    EventKind, EventSubscription, WorkspaceCodec, WorkspaceEvent,
};
use workspace_stream_sdk::stream::session::Termination;
use workspace_stream_sdk::stream::transport::Endpoint;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = "REPLACE_WITH_BEARER_TOKEN".to_string();
    let workspace_id = "REPLACE_WITH_WORKSPACE_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let store = Arc::new(MemoryCredentialStore::with_token(SecretString::from(token)));
        let client = StreamClient::new(
            Endpoint::new("ws://localhost:8080/api/ws/events", "workspace.v1"),
            store.clone(),
            WorkspaceCodec::new(),
        );
        let request = EventSubscription::workspace(workspace_id)
            .with_kind(EventKind::Message)
            .with_kind(EventKind::Tool);

        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            ctrl_c.cancel();
        });

        let mut stream = client
            .open_with_retry(&request, cancel, &RetryPolicy::connect())
            .await?;

        while let Some(item) = stream.recv().await {
            match item? {
                WorkspaceEvent::Connected { server_time_ms } => {
                    println!("connected server_time_ms={server_time_ms}");
                }
                WorkspaceEvent::TextDelta {
                    session_id, delta, ..
                } => {
                    println!("[{session_id}] {delta}");
                }
                WorkspaceEvent::ToolEnd {
                    session_id,
                    tool_name,
                    is_error,
                    ..
                } => {
                    println!("[{session_id}] tool={tool_name} is_error={is_error}");
                }
                _ => {}
            }
        }

        if stream.termination() == Some(Termination::Unauthorized) {
            println!("token rejected; auth_state={:?}", store.auth_state());
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
