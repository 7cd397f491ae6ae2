// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! ColabScan Library
//!
//! This library implements the binary CoLa-B telegram protocol used to
//! configure 2-D laser scanners over TCP and decodes their scan data
//! telegrams into distances and planar point clouds.
//!
//! # Features
//!
//! - **Telegram Codec** - Framing, length and XOR checksum of CoLa-B telegrams
//! - **Client** - Request/acknowledgement exchange with timeout handling
//! - **Scan Decoder** - `LMDscandata` decoding with a cached angular geometry
//! - **Scanner** - Login handshake, scan polling and device queries
//!
//! # Example
//!
//! ```ignore
//! use colabscan::scanner::{Scanner, ScannerConfig};
//!
//! let mut scanner = Scanner::new(ScannerConfig::default());
//! scanner.connect(("192.168.0.1", 2112)).await?;
//!
//! loop {
//!     scanner.poll().await?;
//!     let points = scanner.points();
//! }
//! ```
//!
//! See the `scanpub` and `colabctl` binaries for complete usage.

#![warn(missing_docs)]

/// CoLa-B request/acknowledgement client
pub mod client;

/// Common utilities
pub mod common;

/// Scan data decoding and projections
pub mod scan;

/// Scanner device orchestration
pub mod scanner;

/// Telegram framing, checksum and stream reassembly
pub mod telegram;
