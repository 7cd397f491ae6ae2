// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    client::Client,
    scan::{Fields, ScanFrame, SCAN_DATA},
    telegram::{Arguments, CommandKind, Error, Telegram},
};
use clap::ValueEnum;
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use std::{fmt, io, time::Duration};
use tokio::net::ToSocketAddrs;

/// Access levels accepted by `SetAccessMode`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum AccessLevel {
    /// Machine operator
    Maintenance = 2,
    /// Authorized client, sufficient for scan data and configuration
    AuthorizedClient = 3,
    /// Service technician
    Service = 4,
}

impl AccessLevel {
    /// Password hash the device expects for this level.
    pub fn password(&self) -> u32 {
        match self {
            AccessLevel::Maintenance => 0xB21ACE26,
            AccessLevel::AuthorizedClient => 0xF4724744,
            AccessLevel::Service => 0x81BE23AA,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AccessLevel::Maintenance => write!(f, "maintenance"),
            AccessLevel::AuthorizedClient => write!(f, "authorized-client"),
            AccessLevel::Service => write!(f, "service"),
        }
    }
}

/// Device name and firmware version from `DeviceIdent`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceIdent {
    /// Device type name
    pub name: String,
    /// Firmware version
    pub version: String,
}

impl DeviceIdent {
    /// Decodes the `DeviceIdent` acknowledgement payload.
    pub fn decode(payload: &[u8]) -> Result<DeviceIdent, Error> {
        let mut fields = Fields::new(payload);
        Ok(DeviceIdent {
            name: fields.string()?,
            version: fields.string()?,
        })
    }
}

/// One angular sector of the scan configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sector {
    /// Angular resolution in degrees
    pub resolution: f64,
    /// Start angle in degrees
    pub start: f64,
    /// Stop angle in degrees
    pub stop: f64,
}

/// Scan frequency and sectors from `LMPscancfg`.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanConfig {
    /// Scan frequency in Hz
    pub frequency: f64,
    /// Active angular sectors
    pub sectors: Vec<Sector>,
}

impl ScanConfig {
    /// Decodes the `LMPscancfg` acknowledgement payload.
    pub fn decode(payload: &[u8]) -> Result<ScanConfig, Error> {
        let mut fields = Fields::new(payload);
        let frequency = fields.u32()? as f64 / 100.0;
        let count = fields.u16()?;
        let sectors = (0..count)
            .map(|_| -> Result<Sector, Error> {
                Ok(Sector {
                    resolution: fields.u32()? as f64 / 10000.0,
                    start: fields.i32()? as f64 / 10000.0,
                    stop: fields.i32()? as f64 / 10000.0,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScanConfig { frequency, sectors })
    }
}

impl fmt::Display for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} Hz", self.frequency)?;
        for sector in &self.sectors {
            write!(
                f,
                " [{}°..{}° step {}°]",
                sector.start, sector.stop, sector.resolution
            )?;
        }
        Ok(())
    }
}

/// Timeouts and credentials used by [`Scanner`].
#[derive(Copy, Clone, Debug)]
pub struct ScannerConfig {
    /// Access level requested by the login handshake
    pub access_level: AccessLevel,
    /// Timeout for login and other configuration commands
    pub login_timeout: Duration,
    /// Timeout for scan data reads, long enough for a full scan to complete
    pub scan_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            access_level: AccessLevel::AuthorizedClient,
            login_timeout: Duration::from_secs(1),
            scan_timeout: Duration::from_secs(5),
        }
    }
}

/// A 2-D ranging sensor reached over CoLa-B.
///
/// Holds the connection, the login state and the most recent scan frame.
/// The first `poll` after `connect` logs in; every poll then reads one scan.
#[derive(Debug, Default)]
pub struct Scanner {
    config: ScannerConfig,
    client: Option<Client>,
    logged_in: bool,
    frame: ScanFrame,
}

impl Scanner {
    /// Creates a disconnected scanner.
    pub fn new(config: ScannerConfig) -> Scanner {
        Scanner {
            config,
            client: None,
            logged_in: false,
            frame: ScanFrame::new(),
        }
    }

    /// Configuration the scanner was created with.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Connects to the device, replacing any previous connection.
    pub async fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> io::Result<()> {
        self.disconnect();
        let client = Client::connect(addr).await?;
        info!("connected to scanner at {}", client.peer_addr());
        self.client = Some(client);
        Ok(())
    }

    /// Closes the connection.  Safe to call more than once.
    pub fn disconnect(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.disconnect();
        }
        self.logged_in = false;
    }

    /// Returns true while the connection is open.
    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(Client::is_connected)
    }

    /// Sends a command using the configuration timeout.
    pub async fn command(
        &mut self,
        kind: CommandKind,
        name: &str,
        args: &[u8],
    ) -> Result<Telegram, Error> {
        let timeout = self.config.login_timeout;
        self.send(kind, name, args, timeout).await
    }

    async fn send(
        &mut self,
        kind: CommandKind,
        name: &str,
        args: &[u8],
        timeout: Duration,
    ) -> Result<Telegram, Error> {
        match self.client.as_mut() {
            Some(client) => client.send(kind, name, args, timeout).await,
            None => Err(Error::NoSocket),
        }
    }

    /// Changes the access level to the configured one.
    pub async fn login(&mut self) -> Result<(), Error> {
        let level = self.config.access_level;
        let args = Arguments::new().u8(level as u8).u32(level.password());
        let ack = self
            .command(CommandKind::Method, "SetAccessMode", args.as_bytes())
            .await?;

        match Fields::new(ack.payload()).u8()? {
            0 => Err(Error::AccessDenied(level as u8)),
            _ => {
                debug!("access level {} granted", level);
                self.logged_in = true;
                Ok(())
            }
        }
    }

    /// Reads one scan into the frame, logging in first if this connection
    /// has not done so yet.
    pub async fn poll(&mut self) -> Result<&ScanFrame, Error> {
        if !self.logged_in {
            self.login().await?;
        }

        let timeout = self.config.scan_timeout;
        let ack = self
            .send(CommandKind::Read, SCAN_DATA, &[], timeout)
            .await?;
        self.frame.decode(ack.payload())?;

        Ok(&self.frame)
    }

    /// The most recently polled scan frame.
    pub fn frame(&self) -> &ScanFrame {
        &self.frame
    }

    /// Distances of the latest frame in metres.
    pub fn distances(&self) -> Array1<f32> {
        self.frame.distances()
    }

    /// Points of the latest frame as an N×3 array in metres.
    pub fn points(&mut self) -> Array2<f32> {
        self.frame.points()
    }

    /// Reads the device name and firmware version.
    pub async fn device_ident(&mut self) -> Result<DeviceIdent, Error> {
        let ack = self.command(CommandKind::Read, "DeviceIdent", &[]).await?;
        DeviceIdent::decode(ack.payload())
    }

    /// Reads the device serial number.
    pub async fn serial_number(&mut self) -> Result<String, Error> {
        let ack = self.command(CommandKind::Read, "SerialNumber", &[]).await?;
        Fields::new(ack.payload()).string()
    }

    /// Reads the scan frequency and angular sectors.
    pub async fn scan_config(&mut self) -> Result<ScanConfig, Error> {
        let ack = self.command(CommandKind::Read, "LMPscancfg", &[]).await?;
        ScanConfig::decode(ack.payload())
    }

    /// Starts the measurement motor and laser.
    pub async fn start_measurement(&mut self) -> Result<(), Error> {
        self.status_method("LMCstartmeas").await
    }

    /// Stops the measurement and puts the device into standby.
    pub async fn stop_measurement(&mut self) -> Result<(), Error> {
        self.status_method("LMCstopmeas").await
    }

    /// Leaves the configuration state and returns the device to measurement.
    pub async fn run(&mut self) -> Result<(), Error> {
        let ack = self.command(CommandKind::Method, "Run", &[]).await?;
        if Fields::new(ack.payload()).u8()? == 0 {
            warn!("device rejected Run");
        }
        Ok(())
    }

    async fn status_method(&mut self, name: &str) -> Result<(), Error> {
        let ack = self.command(CommandKind::Method, name, &[]).await?;
        let status = Fields::new(ack.payload()).u8()?;
        if status != 0 {
            warn!("{} returned status {}", name, status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scan::tests::scan_payload,
        telegram::{read_telegram, TelegramWriter},
    };
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::{io::AsyncWriteExt as _, net::TcpListener};

    #[derive(Default)]
    struct Counters {
        logins: AtomicUsize,
        scans: AtomicUsize,
    }

    /// Loopback device which answers the commands a scanner issues.
    async fn simulated_scanner(grant: bool, counters: Arc<Counters>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let counters = counters.clone();
                tokio::spawn(async move {
                    let mut writer = TelegramWriter::new();
                    while let Ok(Some(request)) = read_telegram(&mut sock).await {
                        let (prefix, payload) = match (request.prefix(), request.name()) {
                            ("sMN", "SetAccessMode") => {
                                counters.logins.fetch_add(1, Ordering::SeqCst);
                                ("sAN", vec![grant as u8])
                            }
                            ("sRN", "LMDscandata") => {
                                let n = counters.scans.fetch_add(1, Ordering::SeqCst) as u16;
                                let mut payload = scan_payload(1.0, -450_000, 2500, &[100, 200, 300]);
                                payload[12..14].copy_from_slice(&n.to_be_bytes());
                                ("sRA", payload)
                            }
                            ("sRN", "DeviceIdent") => (
                                "sRA",
                                Arguments::new()
                                    .string("LMS1xx")
                                    .string("V1.80")
                                    .as_bytes()
                                    .to_vec(),
                            ),
                            ("sRN", "SerialNumber") => (
                                "sRA",
                                Arguments::new().string("1234567").as_bytes().to_vec(),
                            ),
                            ("sRN", "LMPscancfg") => (
                                "sRA",
                                Arguments::new()
                                    .u32(5000)
                                    .u16(1)
                                    .u32(5000)
                                    .i32(-450_000)
                                    .i32(2_250_000)
                                    .as_bytes()
                                    .to_vec(),
                            ),
                            ("sMN", "LMCstartmeas") | ("sMN", "LMCstopmeas") => ("sAN", vec![0]),
                            ("sMN", "Run") => ("sAN", vec![1]),
                            _ => ("sFA", vec![0x00, 0x05]),
                        };
                        let msg = writer.encode_prefix(prefix, request.name(), &payload);
                        if sock.write_all(msg).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_poll_logs_in_once() {
        let counters = Arc::new(Counters::default());
        let addr = simulated_scanner(true, counters.clone()).await;

        let mut scanner = Scanner::new(ScannerConfig::default());
        scanner.connect(addr).await.unwrap();

        for i in 0..10u16 {
            let frame = scanner.poll().await.unwrap();
            assert_eq!(frame.scan_counter, i);
            assert_eq!(frame.radii(), &[300, 200, 100]);
        }

        assert_eq!(counters.logins.load(Ordering::SeqCst), 1);
        assert_eq!(counters.scans.load(Ordering::SeqCst), 10);

        let distances = scanner.distances();
        assert!((distances[0] - 0.3).abs() < 1e-6);
        assert_eq!(scanner.points().shape(), &[3, 3]);
    }

    #[tokio::test]
    async fn test_reconnect_logs_in_again() {
        let counters = Arc::new(Counters::default());
        let addr = simulated_scanner(true, counters.clone()).await;

        let mut scanner = Scanner::new(ScannerConfig::default());
        scanner.connect(addr).await.unwrap();
        scanner.poll().await.unwrap();

        scanner.disconnect();
        scanner.disconnect();
        assert!(!scanner.is_connected());
        assert!(matches!(scanner.poll().await, Err(Error::NoSocket)));

        scanner.connect(addr).await.unwrap();
        scanner.poll().await.unwrap();
        assert_eq!(counters.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_access_denied() {
        let counters = Arc::new(Counters::default());
        let addr = simulated_scanner(false, counters.clone()).await;

        let mut scanner = Scanner::new(ScannerConfig::default());
        scanner.connect(addr).await.unwrap();

        assert!(matches!(scanner.poll().await, Err(Error::AccessDenied(3))));
        assert_eq!(counters.scans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_silent_device_not_acknowledged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(sock);
        });

        let mut scanner = Scanner::new(ScannerConfig {
            login_timeout: Duration::from_millis(100),
            ..ScannerConfig::default()
        });
        scanner.connect(addr).await.unwrap();

        assert!(matches!(
            scanner.poll().await,
            Err(Error::DialectNotAcknowledged { .. })
        ));
        peer.abort();
    }

    #[tokio::test]
    async fn test_device_queries() {
        let counters = Arc::new(Counters::default());
        let addr = simulated_scanner(true, counters).await;

        let mut scanner = Scanner::new(ScannerConfig::default());
        scanner.connect(addr).await.unwrap();

        let ident = scanner.device_ident().await.unwrap();
        assert_eq!(ident.name, "LMS1xx");
        assert_eq!(ident.version, "V1.80");

        assert_eq!(scanner.serial_number().await.unwrap(), "1234567");

        let config = scanner.scan_config().await.unwrap();
        assert_eq!(config.frequency, 50.0);
        assert_eq!(
            config.sectors,
            vec![Sector {
                resolution: 0.5,
                start: -45.0,
                stop: 225.0
            }]
        );

        scanner.login().await.unwrap();
        scanner.stop_measurement().await.unwrap();
        scanner.start_measurement().await.unwrap();
        scanner.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let counters = Arc::new(Counters::default());
        let addr = simulated_scanner(true, counters).await;

        let mut scanner = Scanner::new(ScannerConfig::default());
        scanner.connect(addr).await.unwrap();

        match scanner.command(CommandKind::Read, "NoSuchVar", &[]).await {
            Err(Error::UnexpectedAcknowledgement { actual, .. }) => {
                assert_eq!(actual, ("sFA".to_string(), "NoSuchVar".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scan_config_truncated() {
        let payload = Arguments::new().u32(5000).u16(2).u32(5000).i32(0).i32(0);
        assert!(matches!(
            ScanConfig::decode(payload.as_bytes()),
            Err(Error::UnexpectedEndOfSlice(_))
        ));
    }
}
