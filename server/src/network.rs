//! Server network layer handling the router connection and the event loop

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::store::{Context, StoreClient};
use dbss_shared::datagram::MAX_DATAGRAM_SIZE;
use dbss_shared::messages::{add_range, remove_range};
use dbss_shared::{Channel, Datagram, DoIdRange};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// How often stale loads are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { data: Vec<u8> },
    Shutdown,
}

/// DBSS node: one UDP connection to the router and the dispatcher behind it
pub struct Server {
    socket: Arc<UdpSocket>,
    router: SocketAddr,
    range: DoIdRange,
    dispatcher: Dispatcher,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<Datagram>,
    outbound_rx: mpsc::UnboundedReceiver<Datagram>,
}

impl Server {
    /// Binds the router socket. `first_context` seeds the database context
    /// counter.
    pub async fn new(config: &ServerConfig, first_context: Context) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_address).await?);
        info!(
            "DBSS bound to {}, router at {}",
            socket.local_addr()?,
            config.router_address
        );

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            config.range,
            Arc::clone(&config.classes),
            StoreClient::new(config.database, first_context),
            config.load_timeout,
            outbound_tx.clone(),
        );

        Ok(Server {
            socket,
            router: config.router_address,
            range: config.range,
            dispatcher,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender for control messages such as [`ServerMessage::Shutdown`].
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for router datagrams
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();
        let router = self.router;

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if addr != router {
                            warn!("Ignoring {} bytes from unknown peer {}", len, addr);
                            continue;
                        }

                        let data = buffer[..len].to_vec();
                        if let Err(e) = server_tx.send(ServerMessage::DatagramReceived { data }) {
                            error!("Failed to send datagram to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outbound queue onto the socket
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let router = self.router;
        let mut outbound_rx = std::mem::replace(&mut self.outbound_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(dg) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(dg.as_bytes(), router).await {
                    error!("Failed to send {} bytes to router: {}", dg.len(), e);
                }
            }
        });
    }

    fn subscribe(&self) -> Result<(), ServerError> {
        let dg = add_range(Channel::from(self.range.min), Channel::from(self.range.max))?;
        self.outbound_tx
            .send(dg)
            .map_err(|_| DispatchError::OutboundClosed)?;
        info!("Subscribed to object range {}", self.range);
        Ok(())
    }

    /// Sent straight to the socket so it goes out even if the sender task
    /// is already gone.
    async fn unsubscribe(&self) -> Result<(), ServerError> {
        let dg = remove_range(Channel::from(self.range.min), Channel::from(self.range.max))?;
        self.socket.send_to(dg.as_bytes(), self.router).await?;
        info!("Unsubscribed from object range {}", self.range);
        Ok(())
    }

    /// Main server loop: subscribe, dispatch until shutdown, unsubscribe.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.subscribe()?;

        let mut sweep_interval = interval(SWEEP_INTERVAL);

        info!("DBSS started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { data }) => {
                            match self.dispatcher.handle_datagram(&data) {
                                Ok(()) => {}
                                Err(DispatchError::OutboundClosed) => {
                                    error!("Outbound queue closed, stopping");
                                    break;
                                }
                                Err(e) => error!("Failed to handle datagram: {}", e),
                            }
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("DBSS shutting down");
                            break;
                        }
                    }
                },

                _ = sweep_interval.tick() => {
                    let expired = self.dispatcher.expire_pending_loads();
                    if expired > 0 {
                        debug!(
                            "Swept {} stale load(s); {} active, {} loading",
                            expired,
                            self.dispatcher.cache().active_count(),
                            self.dispatcher.cache().loading_count()
                        );
                    }
                },
            }
        }

        self.unsubscribe().await
    }
}
