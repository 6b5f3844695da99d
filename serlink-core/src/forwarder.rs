//! Client-mode port forwarder: local listeners whose connections become
//! synthetic TCP flows over the link.
//!
//! Started by the bridge once IPCP opens. Each accepted socket is handed to
//! the bridge, which asks the stack for an active open toward the peer; the
//! socket stays parked (and its client's bytes stay in the kernel buffer)
//! until the flow reaches ESTABLISHED and a proxy pair is attached.

use crate::bridge::Event;
use crate::config::Config;
use crate::shutdown::SessionShutdown;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawn one listener task per configured `local_port -> remote_port`
/// mapping. The tasks run until the session shutdown signal is raised.
pub fn spawn_listeners(
    config: &Arc<Config>,
    events: mpsc::Sender<Event>,
    shutdown: SessionShutdown,
) -> Vec<JoinHandle<()>> {
    config
        .forwards
        .iter()
        .map(|(&local_port, &remote_port)| {
            tokio::spawn(listen_loop(
                local_port,
                remote_port,
                events.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn listen_loop(
    local_port: u16,
    remote_port: u16,
    events: mpsc::Sender<Event>,
    shutdown: SessionShutdown,
) {
    let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(local_port, %error, "cannot bind forwarder port");
            return;
        }
    };
    tracing::info!(local_port, remote_port, "port forward listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.stopped() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                tracing::info!(local_port, %peer, "forwarding new connection");
                if events
                    .send(Event::ForwardConnect {
                        socket,
                        remote_port,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(error) => {
                tracing::warn!(local_port, %error, "accept failed");
            }
        }
    }
    tracing::debug!(local_port, "port forward stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shutdown::SessionEnd;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepted_connections_reach_the_bridge() {
        // Bind on an ephemeral port first so the test does not collide.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = Config::client();
        config.forwards.insert(port, 2222);
        let config = Arc::new(config);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let shutdown = SessionShutdown::new();
        let tasks = spawn_listeners(&config, events_tx, shutdown.clone());
        assert_eq!(tasks.len(), 1);

        // Give the listener a moment to bind, then connect to it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        match events_rx.recv().await {
            Some(Event::ForwardConnect { remote_port, .. }) => assert_eq!(remote_port, 2222),
            other => panic!("expected a forward request, got {other:?}"),
        }

        shutdown.raise(SessionEnd::Operator);
        for task in tasks {
            let _ = task.await;
        }
    }
}
