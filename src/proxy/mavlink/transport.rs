//! Wire transport for the MAVLink endpoint: a UDP socket or a serial port.
//!
//! PAM does not reimplement MAVLink v2 framing (spec §1 non-goal) -- a real
//! deployment links this against a dialect-generated codec. What lives
//! here is the byte-level plumbing any codec needs underneath it: a single
//! type that reads and writes whole frames regardless of whether the
//! endpoint is a UDP socket (one datagram, one frame) or a serial port
//! (length-delimited over a continuous byte stream), so `mod.rs`'s I/O task
//! doesn't care which it has.

use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::warn;

use crate::config::MavlinkEndpoint;

const UDP_RECV_BUF: usize = 4096;

pub enum MavlinkLink {
    Udp {
        socket: UdpSocket,
        peer: Option<std::net::SocketAddr>,
    },
    Serial(Framed<tokio_serial::SerialStream, LengthDelimitedCodec>),
}

impl MavlinkLink {
    pub async fn connect(endpoint: &MavlinkEndpoint) -> io::Result<Self> {
        match endpoint {
            MavlinkEndpoint::Udp { host, port } => {
                // Bind ephemeral locally; the flight controller is the peer
                // we learn from the first datagram received (common for
                // companion-computer-initiates-nothing setups), or we can
                // be told explicitly via `host:port` if it is itself a UDP
                // server.
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                let peer = format!("{host}:{port}").parse().ok();
                if let Some(addr) = peer {
                    socket.connect(addr).await.ok();
                }
                Ok(MavlinkLink::Udp { socket, peer })
            }
            MavlinkEndpoint::Serial { path, baud } => {
                let port = tokio_serial::new(path, *baud)
                    .open_native_async()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(MavlinkLink::Serial(Framed::new(
                    port,
                    LengthDelimitedCodec::new(),
                )))
            }
        }
    }

    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        match self {
            MavlinkLink::Udp { socket, peer } => {
                let mut buf = vec![0u8; UDP_RECV_BUF];
                let (n, from) = socket.recv_from(&mut buf).await?;
                if peer.is_none() {
                    *peer = Some(from);
                    socket.connect(from).await.ok();
                }
                buf.truncate(n);
                Ok(buf)
            }
            MavlinkLink::Serial(framed) => match framed.next().await {
                Some(Ok(bytes)) => Ok(bytes.to_vec()),
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed")),
            },
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            MavlinkLink::Udp { socket, peer } => {
                let Some(addr) = peer else {
                    warn!("dropping outbound MAVLink frame: no peer address learned yet");
                    return Ok(());
                };
                socket.send_to(payload, *addr).await?;
                Ok(())
            }
            MavlinkLink::Serial(framed) => framed.send(Bytes::copy_from_slice(payload)).await,
        }
    }
}
