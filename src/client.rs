//! UDP client owning the socket, the read loop, and the timeout sweep.
//!
//! The client binds an unconnected UDP socket so responses from a server's
//! alternate endpoint (a CHANGE-REQUEST probe answered from the changed IP)
//! are still received, and so the destination can be rebound between probes
//! without losing the local ephemeral port the NAT mapping lives on.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::agent::{Agent, Event, Handler};
use crate::codec::Message;
use crate::error::Error;

/// Receive buffer size; comfortably larger than any discovery response.
const RECV_BUFFER_SIZE: usize = 1024;

/// Client tuning knobs.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tick interval for the transaction timeout sweep
    /// (serialized as milliseconds).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub collector_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            collector_interval: Duration::from_millis(100),
        }
    }
}

/// A STUN client over a single UDP socket.
///
/// Construction spawns two long-lived tasks: a reader that decodes inbound
/// datagrams and hands them to the [`Agent`], and a collector that expires
/// timed-out transactions on a fixed tick.
pub struct Client {
    agent: Arc<Agent>,
    socket: Arc<UdpSocket>,
    server_addr: RwLock<SocketAddr>,
    closed: RwLock<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Binds a fresh ephemeral UDP socket and starts the client against
    /// the given server address.
    pub async fn connect(server: SocketAddr, config: ClientConfig) -> Result<Client, Error> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self::from_socket(socket, server, config))
    }

    /// Starts the client over an already bound socket.
    pub fn from_socket(socket: UdpSocket, server: SocketAddr, config: ClientConfig) -> Client {
        let agent = Arc::new(Agent::new());
        let socket = Arc::new(socket);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_until_closed(
            Arc::clone(&socket),
            Arc::clone(&agent),
            shutdown_rx.clone(),
        ));
        let collector = tokio::spawn(collect_until_closed(
            Arc::clone(&agent),
            config.collector_interval,
            shutdown_rx,
        ));

        Client {
            agent,
            socket,
            server_addr: RwLock::new(server),
            closed: RwLock::new(false),
            shutdown,
            tasks: Mutex::new(vec![reader, collector]),
        }
    }

    /// The socket's bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.socket.local_addr().map_err(Error::from)
    }

    /// The destination used by subsequent sends.
    pub fn server_address(&self) -> SocketAddr {
        *unpoisoned(self.server_addr.read())
    }

    /// Replaces the destination address without rebinding the socket; the
    /// local ephemeral port is preserved. Callers must only rebind between
    /// probes, when no write is in flight.
    pub fn change_server_address(&self, addr: SocketAddr) {
        *unpoisoned(self.server_addr.write()) = addr;
    }

    /// Sends a request and registers its completion handler with the
    /// deadline. If the write fails, the transaction is stopped so the
    /// handler still fires exactly once, with the I/O error.
    pub async fn send(
        &self,
        message: &Message,
        deadline: Instant,
        handler: Handler,
    ) -> Result<(), Error> {
        self.transmit(message, Some((deadline, handler))).await
    }

    /// Sends a message without registering a transaction.
    pub async fn indicate(&self, message: &Message) -> Result<(), Error> {
        self.transmit(message, None).await
    }

    /// Sends a request and awaits its terminal event.
    pub async fn request(&self, message: &Message, deadline: Instant) -> Event {
        let (tx, rx) = oneshot::channel();
        self.send(
            message,
            deadline,
            Box::new(move |event| {
                let _ = tx.send(event);
            }),
        )
        .await?;
        rx.await.unwrap_or(Err(Error::AgentClosed))
    }

    async fn transmit(
        &self,
        message: &Message,
        completion: Option<(Instant, Handler)>,
    ) -> Result<(), Error> {
        if *unpoisoned(self.closed.read()) {
            return Err(Error::ClientClosed);
        }
        let registered = completion.is_some();
        if let Some((deadline, handler)) = completion {
            self.agent.start(message.transaction_id, deadline, handler)?;
        }
        let server = self.server_address();
        match self.socket.send_to(message.as_bytes(), server).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = Error::from(err);
                if registered {
                    if let Err(stop_err) = self
                        .agent
                        .stop_with_error(message.transaction_id, err.clone())
                    {
                        debug!("failed to stop transaction after send error: {}", stop_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Tears the client down: closes the agent (every pending handler gets
    /// a closed event), signals both tasks, and waits for them to exit.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut closed = unpoisoned(self.closed.write());
            if *closed {
                return Err(Error::ClientClosed);
            }
            *closed = true;
        }
        let agent_result = self.agent.close();
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = unpoisoned(self.tasks.lock()).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        match agent_result {
            Err(err) if err != Error::AgentClosed => Err(err),
            _ => Ok(()),
        }
    }
}

fn unpoisoned<G>(result: Result<G, PoisonError<G>>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Reader task: receive, decode, dispatch to the agent. Exits on shutdown
/// or when the agent reports closed; malformed datagrams are logged and
/// dropped.
async fn read_until_closed(
    socket: Arc<UdpSocket>,
    agent: Arc<Agent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        tokio::select! {
            _ = shutdown.changed() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match Message::decode(&buf[..len]) {
                    Ok(message) => {
                        trace!("decoded {} byte message from {}", len, from);
                        if matches!(agent.process(message), Err(Error::AgentClosed)) {
                            return;
                        }
                    }
                    Err(err) => debug!("dropping undecodable datagram from {}: {}", from, err),
                },
                Err(err) => debug!("socket receive failed: {}", err),
            },
        }
    }
}

/// Collector task: sweep expired transactions on a fixed tick. Exits on
/// shutdown or on any agent error other than closed.
async fn collect_until_closed(
    agent: Arc<Agent>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => match agent.collect(Instant::now()) {
                Ok(()) | Err(Error::AgentClosed) => {}
                Err(err) => {
                    warn!("timeout collector stopped: {}", err);
                    return;
                }
            },
        }
    }
}
