use std::{
    future::{Future, IntoFuture},
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bytes::BytesMut;
use derive_builder::Builder;
use derive_new::new;
use log::{debug, error, info};
use tokio::{
    net::{TcpListener, UdpSocket},
    select,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Where the relay listens for producers.
#[derive(new, Debug, Clone)]
pub enum Receiver {
    TcpStream { ip: String, port: u16 },
    UdpFramed { ip: String, port: u16, buffer_size: usize },
}

impl Receiver {
    fn addr(&self) -> anyhow::Result<SocketAddr> {
        let (ip, port) = match self {
            Receiver::TcpStream { ip, port } => (ip, *port),
            Receiver::UdpFramed { ip, port, .. } => (ip, *port),
        };
        let ip: IpAddr = ip
            .parse()
            .with_context(|| format!("Invalid listen address {ip}"))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Bind the socket. Failure here is fatal for the relay.
    pub async fn bind(&self) -> anyhow::Result<ListeningSocket> {
        let addr = self.addr()?;
        match self {
            Receiver::TcpStream { .. } => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("TCP socket binding on {addr} failed"))?;
                Ok(ListeningSocket::Tcp(listener))
            }
            Receiver::UdpFramed { buffer_size, .. } => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .with_context(|| format!("UDP socket binding on {addr} failed"))?;
                Ok(ListeningSocket::Udp(socket, (*buffer_size).max(1)))
            }
        }
    }
}

pub enum ListeningSocket {
    Tcp(TcpListener),
    Udp(UdpSocket, usize),
}

impl ListeningSocket {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ListeningSocket::Tcp(listener) => listener.local_addr(),
            ListeningSocket::Udp(socket, _) => socket.local_addr(),
        }
    }
}

/// Accept loop (TCP) or datagram loop (UDP) feeding the dispatcher.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ReceiverTask {
    socket: ListeningSocket,
    dispatcher: Arc<Dispatcher>,
    shutdown_token: CancellationToken,
}

impl ReceiverTask {
    async fn tcp_stream_run(&self, listener: &TcpListener) {
        loop {
            select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutting down receiver task");
                    break;
                }
                //Accept new TCP connections
                session = listener.accept() => match session {
                    Ok((stream, peer)) => {
                        let worker = self.dispatcher.assign(stream, peer);
                        debug!("Peer {} assigned to worker {}", peer, worker);
                    }
                    Err(err) => {
                        error!("Accept failed. Reason: {}", err);
                        sleep(ACCEPT_RETRY).await;
                    }
                }
            }
        }
    }

    async fn udp_run(&self, socket: &UdpSocket, buffer_size: usize) {
        let mut buf = BytesMut::with_capacity(buffer_size);
        loop {
            buf.reserve(buffer_size);
            select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutting down receiver task");
                    break;
                }
                res = socket.recv_buf_from(&mut buf) => match res {
                    Ok((len, _)) if len > 0 => self.dispatcher.assign_datagram(buf.split().freeze()),
                    Ok(_) => buf.clear(),
                    Err(err) => {
                        error!("Socket recv failed. Reason: {}", err);
                        buf.clear();
                    }
                }
            }
        }
    }

    async fn run(self) {
        match &self.socket {
            ListeningSocket::Tcp(listener) => self.tcp_stream_run(listener).await,
            ListeningSocket::Udp(socket, buffer_size) => self.udp_run(socket, *buffer_size).await,
        }
    }
}

impl IntoFuture for ReceiverTask {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}
