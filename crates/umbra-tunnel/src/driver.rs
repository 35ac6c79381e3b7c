//! The tokio reactor owning the community.
//!
//! One task runs the whole core: it selects over the UDP socket, the two
//! periodic ticks, the request-cache deadline, the exit-datagram channel, and
//! the command channel from the embedding application. Everything that
//! touches community state is marshalled onto this task, so the community
//! itself needs no locks.

use std::future;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use umbra_crypto::identity::TunnelKeypair;

use crate::community::TunnelCommunity;
use crate::external::{DatagramSocket, Discovery, PacketSink, TunnelObserver, UdpBinder};
use crate::settings::TunnelSettings;
use crate::Result;

/// Interval between circuit top-up / sweep passes.
const CIRCUIT_TICK: Duration = Duration::from_secs(5);

/// Largest datagram the reactor will accept.
const MAX_DATAGRAM: usize = 65535;

/// Commands the embedding application sends into the reactor.
pub enum DriverCommand {
    /// Tunnel a user datagram to its destination over the next circuit in
    /// the round-robin.
    TunnelData {
        destination: SocketAddrV4,
        payload: Vec<u8>,
    },
    Shutdown,
}

/// Cheap cloneable handle for submitting commands to a running driver.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverHandle {
    pub fn tunnel_data(&self, destination: SocketAddrV4, payload: Vec<u8>) {
        let _ = self.tx.send(DriverCommand::TunnelData {
            destination,
            payload,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DriverCommand::Shutdown);
    }
}

/// The reactor: owns the UDP socket and the community.
pub struct TunnelDriver {
    socket: Arc<UdpSocket>,
    community: TunnelCommunity,
    command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    exit_rx: mpsc::UnboundedReceiver<ExitDatagram>,
}

type ExitDatagram = (u32, SocketAddrV4, Vec<u8>);

impl TunnelDriver {
    /// Bind the community socket and assemble the reactor. Must be called
    /// from within a tokio runtime (exit sockets spawn reader tasks on it).
    pub fn new(
        settings: TunnelSettings,
        keypair: TunnelKeypair,
        discovery: Box<dyn Discovery>,
        observer: Box<dyn TunnelObserver>,
        listen_addr: SocketAddr,
    ) -> Result<(Self, DriverHandle)> {
        let std_socket = std::net::UdpSocket::bind(listen_addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        info!("tunnel listening on {}", socket.local_addr()?);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let community = TunnelCommunity::new(
            settings,
            keypair,
            discovery,
            Box::new(UdpSink {
                socket: Arc::clone(&socket),
            }),
            observer,
            Box::new(TokioBinder { exit_tx }),
        );

        Ok((
            Self {
                socket,
                community,
                command_rx,
                exit_rx,
            },
            DriverHandle { tx: command_tx },
        ))
    }

    /// The address the community socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run until shut down. Consumes the reactor.
    pub async fn run(mut self) {
        let socket = Arc::clone(&self.socket);
        let mut circuit_tick = tokio::time::interval(CIRCUIT_TICK);
        let mut ping_tick = tokio::time::interval(self.community.settings().ping_interval());
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let deadline = self.community.next_timeout();
            let deadline_sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.community.handle_packet(from, &buf[..len]),
                    Err(e) => warn!("udp receive failed: {e}"),
                },
                _ = circuit_tick.tick() => self.community.do_circuits(),
                _ = ping_tick.tick() => self.community.do_ping(),
                Some((circuit_id, source, payload)) = self.exit_rx.recv() => {
                    self.community.on_exit_datagram(circuit_id, source, &payload);
                }
                command = self.command_rx.recv() => match command {
                    Some(DriverCommand::TunnelData { destination, payload }) => {
                        match self.community.select_circuit() {
                            Some(circuit_id) => self.community.tunnel_data_to_end(
                                destination,
                                &payload,
                                circuit_id,
                            ),
                            None => debug!("no active circuit for user data"),
                        }
                    }
                    Some(DriverCommand::Shutdown) | None => {
                        self.community.shutdown();
                        break;
                    }
                },
                _ = deadline_sleep => self.community.fire_timeouts(Instant::now()),
            }
        }
    }
}

/// Community packet emission over the shared socket.
struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl PacketSink for UdpSink {
    fn send_to(&mut self, addr: SocketAddr, packet: &[u8]) {
        // UDP gives no delivery guarantee anyway; a full send buffer is a
        // drop like any other.
        if let Err(e) = self.socket.try_send_to(packet, addr) {
            debug!("udp send to {addr} failed: {e}");
        }
    }
}

/// Binds real ephemeral exit sockets and pumps received datagrams back into
/// the reactor as events.
struct TokioBinder {
    exit_tx: mpsc::UnboundedSender<ExitDatagram>,
}

impl UdpBinder for TokioBinder {
    fn bind_ephemeral(&mut self, circuit_id: u32) -> io::Result<Box<dyn DatagramSocket>> {
        let std_socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let port = socket.local_addr()?.port();

        let reader_socket = Arc::clone(&socket);
        let exit_tx = self.exit_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, SocketAddr::V4(source))) => {
                        if exit_tx
                            .send((circuit_id, source, buf[..len].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok((_, SocketAddr::V6(source))) => {
                        debug!("ignoring IPv6 datagram from {source} on exit {circuit_id}");
                    }
                    Err(e) => {
                        debug!("exit socket {circuit_id} receive failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(TokioExitSocket {
            socket,
            port,
            reader,
        }))
    }
}

struct TokioExitSocket {
    socket: Arc<UdpSocket>,
    port: u16,
    reader: JoinHandle<()>,
}

impl DatagramSocket for TokioExitSocket {
    fn send_to(&mut self, data: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.socket.try_send_to(data, SocketAddr::V4(dest))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Drop for TokioExitSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
