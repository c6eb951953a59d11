//! TCP accept loop for station connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{error, info, warn};

use crate::events::EventFanout;
use crate::registry::FleetRegistry;
use crate::session::{SessionEnd, SessionSettings, run_session};
use crate::shutdown::ShutdownSignal;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct StationServer {
    listener: TcpListener,
    registry: Arc<FleetRegistry>,
    events: Arc<EventFanout>,
    settings: SessionSettings,
}

impl StationServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        registry: Arc<FleetRegistry>,
        events: Arc<EventFanout>,
        settings: SessionSettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(StationServer {
            listener,
            registry,
            events,
            settings,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept stations until shutdown, then close every open session.
    pub async fn run(self, shutdown: ShutdownSignal) {
        match self.local_addr() {
            Ok(addr) => info!("Accepting charging stations on {}", addr),
            Err(e) => warn!("Accepting charging stations on an unknown address: {}", e),
        }
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) => {
                        error!("Failed to accept station connection: {}", e);
                        if !back_off(&shutdown).await {
                            break;
                        }
                    }
                },
                _ = shutdown.wait() => break,
            }
        }

        let sessions = self.registry.sessions();
        info!("Station server stopping, closing {} sessions", sessions.len());
        for session in sessions {
            session.close();
        }
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        let registry = self.registry.clone();
        let events = self.events.clone();
        let settings = self.settings;
        tokio::spawn(async move {
            match run_session(stream, addr.to_string(), registry, events, settings).await {
                Ok(SessionEnd::PeerClosed) | Ok(SessionEnd::Closed) => {}
                Err(e) => warn!("Session from {} ended: {}", addr, e),
            }
        });
    }
}

/// Returns false when shutdown arrives during the pause.
async fn back_off(shutdown: &ShutdownSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
        _ = shutdown.wait() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Inbound, encode_inbound, read_frame, write_frame};
    use crate::session::tests::registry;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_accepts_and_shuts_down() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let server = StationServer::bind(
            "127.0.0.1:0",
            registry.clone(),
            events,
            SessionSettings::default(),
        )
        .await
        .expect("Could not bind");
        let addr = server.local_addr().expect("Could not get address");
        let shutdown = ShutdownSignal::new();
        let server_task = tokio::spawn(server.run(shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.expect("Could not connect");
        let hello = encode_inbound(&Frame {
            message_id: 1,
            body: Inbound::Hello {
                client_id: "C1".into(),
                firmware_version: "2.1".into(),
            },
        });
        write_frame(&mut stream, &hello).await.expect("Could not write");
        while registry.session("C1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.trigger();
        server_task.await.expect("Server panicked");

        // The session closes its socket
        assert!(read_frame(&mut stream).await.is_err());
        while registry.session("C1").is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_backs_off() {
        let shutdown = ShutdownSignal::new();
        let started = Instant::now();
        assert!(back_off(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        shutdown.trigger();
        let started = Instant::now();
        assert!(!back_off(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }
}
