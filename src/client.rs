// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::telegram::{read_telegram, CommandKind, Error, Telegram, TelegramWriter};
use log::{debug, trace};
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, ToSocketAddrs},
    sync::Mutex,
};

/// A single TCP connection to a CoLa-B device.
///
/// Only one request may be outstanding at a time.  `send` borrows the client
/// mutably so overlapping requests on the same connection cannot be expressed;
/// use [`RequestQueue`] to share one connection between tasks.
#[derive(Debug)]
pub struct Client {
    stream: Option<TcpStream>,
    writer: TelegramWriter,
    peer: SocketAddr,
}

impl Client {
    /// Opens a connection to the device.  Connection failures are returned
    /// unchanged so callers can tell a refused connection from other causes.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!("connected to {}", peer);

        Ok(Client {
            stream: Some(stream),
            writer: TelegramWriter::new(),
            peer,
        })
    }

    /// Returns the address of the connected device.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true while the socket is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends a request and waits up to `timeout` for its acknowledgement.
    ///
    /// # Arguments
    /// * `kind` - Command class which selects the request and acknowledgement
    ///   prefixes
    /// * `name` - Command name, such as `LMDscandata`
    /// * `args` - Argument bytes, empty when the command takes none
    /// * `timeout` - Upper bound on the wait for the acknowledgement
    ///
    /// # Errors
    /// Returns `DialectNotAcknowledged` on timeout, `Transport` on socket
    /// errors, `UnexpectedAcknowledgement` when the device answers with a
    /// different command, or a framing error for a corrupt telegram.
    ///
    /// A timeout, transport failure or framing error that loses the stream
    /// position closes the connection, and later calls return `NoSocket`.
    pub async fn send(
        &mut self,
        kind: CommandKind,
        name: &str,
        args: &[u8],
        timeout: Duration,
    ) -> Result<Telegram, Error> {
        let stream = self.stream.as_mut().ok_or(Error::NoSocket)?;
        debug!("send {} {} [{} bytes]", kind.request(), name, args.len());

        let msg = self.writer.encode(kind, name, args);
        trace!("send {:02X?}", msg);
        if let Err(err) = stream.write_all(msg).await {
            self.disconnect();
            return Err(Error::Transport(err));
        }

        let telegram = match tokio::time::timeout(timeout, read_telegram(stream)).await {
            Ok(Ok(Some(telegram))) => telegram,
            Ok(Err(err @ Error::ChecksumMismatch { .. }))
            | Ok(Err(err @ Error::MalformedCommand(_))) => return Err(err),
            result => {
                // The stream position is lost, so a late or partial telegram
                // could pair with the next request.
                self.disconnect();
                return Err(match result {
                    Err(_) => Error::DialectNotAcknowledged {
                        command: format!("{} {}", kind.request(), name),
                        timeout,
                    },
                    Ok(Err(Error::Io(err))) => Error::Transport(err),
                    Ok(Err(err)) => err,
                    Ok(Ok(None)) | Ok(Ok(Some(_))) => Error::Disconnected,
                });
            }
        };

        trace!("received {}", telegram);

        if telegram.prefix() != kind.acknowledgement() || telegram.name() != name {
            return Err(Error::UnexpectedAcknowledgement {
                expected: (kind.acknowledgement().to_string(), name.to_string()),
                actual: (telegram.prefix().to_string(), telegram.name().to_string()),
            });
        }

        Ok(telegram)
    }

    /// Closes the connection.  Safe to call more than once.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("disconnected from {}", self.peer);
        }
    }
}

/// Shares one [`Client`] between tasks.  Callers wait in FIFO order for the
/// single in-flight slot, so acknowledgements always pair with their requests.
#[derive(Debug)]
pub struct RequestQueue {
    client: Mutex<Client>,
}

impl RequestQueue {
    /// Takes ownership of a connected client.
    pub fn new(client: Client) -> RequestQueue {
        RequestQueue {
            client: Mutex::new(client),
        }
    }

    /// Waits for the in-flight slot, then sends the request as
    /// [`Client::send`] does.
    pub async fn send(
        &self,
        kind: CommandKind,
        name: &str,
        args: &[u8],
        timeout: Duration,
    ) -> Result<Telegram, Error> {
        self.client.lock().await.send(kind, name, args, timeout).await
    }

    /// Closes the shared connection once the in-flight request completes.
    pub async fn disconnect(&self) {
        self.client.lock().await.disconnect();
    }

    /// Returns the client once no other task holds the queue.
    pub fn into_inner(self) -> Client {
        self.client.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::Arguments;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Starts a loopback device which answers every request with the matching
    /// acknowledgement, echoing the request arguments as the payload.
    async fn echo_device() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut writer = TelegramWriter::new();
            while let Ok(Some(request)) = read_telegram(&mut sock).await {
                let ack = match request.prefix() {
                    "sRN" => "sRA",
                    "sWN" => "sWA",
                    "sMN" => "sAN",
                    "sEN" => "sEA",
                    other => other,
                };
                let msg = writer.encode_prefix(ack, request.name(), request.payload());
                if sock.write_all(msg).await.is_err() {
                    break;
                }
            }
        });

        addr
    }

    /// Starts a loopback device which reads requests and answers each with
    /// the given raw bytes.
    async fn scripted_device(reply: Option<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            while let Ok(Some(_)) = read_telegram(&mut sock).await {
                match &reply {
                    Some(reply) => sock.write_all(reply).await.unwrap(),
                    None => return,
                }
            }
        });

        addr
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_sequential_round_trips() {
        let addr = echo_device().await;
        let mut client = Client::connect(addr).await.unwrap();

        for i in 0..100u32 {
            let args = Arguments::new().u32(i);
            let ack = client
                .send(CommandKind::Read, "LMDscandata", args.as_bytes(), TIMEOUT)
                .await
                .unwrap();
            assert_eq!(ack.prefix(), "sRA");
            assert_eq!(ack.name(), "LMDscandata");
            assert_eq!(ack.payload(), &i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_acknowledgement_prefixes() {
        let addr = echo_device().await;
        let mut client = Client::connect(addr).await.unwrap();

        for kind in [
            CommandKind::Read,
            CommandKind::Write,
            CommandKind::Method,
            CommandKind::Event,
        ] {
            let ack = client.send(kind, "Run", &[], TIMEOUT).await.unwrap();
            assert_eq!(ack.prefix(), kind.acknowledgement());
            assert!(ack.payload().is_empty());
        }
    }

    #[tokio::test]
    async fn test_queue_concurrent_callers() {
        let addr = echo_device().await;
        let queue = Arc::new(RequestQueue::new(Client::connect(addr).await.unwrap()));

        let tasks: Vec<_> = (0..16u32)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let args = Arguments::new().u32(i);
                    let ack = queue
                        .send(CommandKind::Read, "LMDscandata", args.as_bytes(), TIMEOUT)
                        .await
                        .unwrap();
                    assert_eq!(ack.payload(), &i.to_be_bytes());
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unexpected_acknowledgement() {
        let mut writer = TelegramWriter::new();
        let reply = writer.encode_prefix("sRA", "DeviceIdent", &[]).to_vec();
        let addr = scripted_device(Some(reply)).await;
        let mut client = Client::connect(addr).await.unwrap();

        match client
            .send(CommandKind::Read, "LMDscandata", &[], TIMEOUT)
            .await
        {
            Err(Error::UnexpectedAcknowledgement { expected, actual }) => {
                assert_eq!(expected, ("sRA".to_string(), "LMDscandata".to_string()));
                assert_eq!(actual, ("sRA".to_string(), "DeviceIdent".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_prefix() {
        let mut writer = TelegramWriter::new();
        let reply = writer.encode_prefix("sFA", "Run", &[0, 1]).to_vec();
        let addr = scripted_device(Some(reply)).await;
        let mut client = Client::connect(addr).await.unwrap();

        assert!(matches!(
            client.send(CommandKind::Method, "Run", &[], TIMEOUT).await,
            Err(Error::UnexpectedAcknowledgement { .. })
        ));
    }

    #[tokio::test]
    async fn test_checksum_error_propagates() {
        let mut writer = TelegramWriter::new();
        let mut reply = writer.encode_prefix("sAN", "Run", &[1]).to_vec();
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        let addr = scripted_device(Some(reply)).await;
        let mut client = Client::connect(addr).await.unwrap();

        assert!(matches!(
            client.send(CommandKind::Method, "Run", &[], TIMEOUT).await,
            Err(Error::ChecksumMismatch { .. })
        ));
        // The whole telegram was consumed, so the stream is still in step.
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_not_acknowledged() {
        // A device speaking another dialect never answers the binary request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(sock);
        });

        let mut client = Client::connect(addr).await.unwrap();
        match client
            .send(
                CommandKind::Method,
                "SetAccessMode",
                &[3, 0xF4, 0x72, 0x47, 0x44],
                Duration::from_millis(100),
            )
            .await
        {
            Err(Error::DialectNotAcknowledged { command, timeout }) => {
                assert_eq!(command, "sMN SetAccessMode");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected {:?}", other),
        }

        peer.abort();
    }

    #[tokio::test]
    async fn test_late_acknowledgement_not_paired() {
        // Answers every request with its sequence number, the first one late.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut writer = TelegramWriter::new();
            let mut seq = 0u8;
            while let Ok(Some(request)) = read_telegram(&mut sock).await {
                if seq == 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                let msg = writer.encode_prefix("sRA", request.name(), &[seq]);
                if sock.write_all(msg).await.is_err() {
                    return;
                }
                seq += 1;
            }
        });

        let mut client = Client::connect(addr).await.unwrap();
        assert!(matches!(
            client
                .send(CommandKind::Read, "LMDscandata", &[], Duration::from_millis(100))
                .await,
            Err(Error::DialectNotAcknowledged { .. })
        ));
        assert!(!client.is_connected());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(
            client.send(CommandKind::Read, "LMDscandata", &[], TIMEOUT).await,
            Err(Error::NoSocket)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_header_closes_connection() {
        let addr = scripted_device(Some(vec![0x02, 0x02, 0x02, 0x03, 0, 0, 0, 4])).await;
        let mut client = Client::connect(addr).await.unwrap();

        assert!(matches!(
            client.send(CommandKind::Read, "LMDscandata", &[], TIMEOUT).await,
            Err(Error::CorruptHeader(_))
        ));
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(CommandKind::Read, "LMDscandata", &[], TIMEOUT).await,
            Err(Error::NoSocket)
        ));
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let addr = scripted_device(None).await;
        let mut client = Client::connect(addr).await.unwrap();

        match client.send(CommandKind::Read, "LMDscandata", &[], TIMEOUT).await {
            Err(Error::Disconnected) | Err(Error::Transport(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_unwrapped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Client::connect(addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let addr = echo_device().await;
        let mut client = Client::connect(addr).await.unwrap();
        assert!(client.is_connected());

        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());

        assert!(matches!(
            client.send(CommandKind::Read, "LMDscandata", &[], TIMEOUT).await,
            Err(Error::NoSocket)
        ));
    }
}
