// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use colabscan::{
    common::{set_process_priority, timestamp},
    scanner::{Scanner, ScannerConfig},
    telegram::Error,
};
use edgefirst_schemas::{
    builtin_interfaces::Time,
    geometry_msgs::{Quaternion, Transform, TransformStamped, Vector3},
    sensor_msgs, serde_cdr,
    std_msgs::{self, Header},
};
use kanal::{AsyncReceiver, AsyncSender};
use ndarray::{Array1, Array2};
use std::{thread, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt as _, Layer as _, Registry};
use tracy_client::{frame_mark, plot};
use zenoh::{
    bytes::{Encoding, ZBytes},
    qos::{CongestionControl, Priority},
    Session,
};

#[cfg(feature = "profiling")]
#[global_allocator]
static GLOBAL: tracy_client::ProfiledAllocator<std::alloc::System> =
    tracy_client::ProfiledAllocator::new(std::alloc::System, 100);

#[derive(Debug)]
#[allow(dead_code)]
pub enum PointFieldType {
    INT8 = 1,
    UINT8 = 2,
    INT16 = 3,
    UINT16 = 4,
    INT32 = 5,
    UINT32 = 6,
    FLOAT32 = 7,
    FLOAT64 = 8,
}

const POINT_FIELDS: [&str; 4] = ["x", "y", "z", "distance"];
const POINT_STEP: u32 = 4 * POINT_FIELDS.len() as u32;

/// Projections of one scan handed from the poll thread to the publisher.
#[derive(Debug)]
struct ScanPoints {
    scan_counter: u16,
    points: Array2<f32>,
    distances: Array1<f32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    args.tracy.then(tracy_client::Client::start);

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(args.rust_log);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(args.rust_log)),
        Err(_) => None,
    };

    let tracy = match args.tracy {
        true => Some(tracing_tracy::TracyLayer::default().with_filter(args.rust_log)),
        false => None,
    };

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    let session = zenoh::open(args.clone())
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    let tf_session = session.clone();
    let tf_msg = TransformStamped {
        header: Header {
            frame_id: args.base_frame_id.clone(),
            stamp: timestamp().unwrap_or(Time { sec: 0, nanosec: 0 }),
        },
        child_frame_id: args.lidar_frame_id.clone(),
        transform: Transform {
            translation: Vector3 {
                x: args.lidar_tf_vec[0],
                y: args.lidar_tf_vec[1],
                z: args.lidar_tf_vec[2],
            },
            rotation: Quaternion {
                x: args.lidar_tf_quat[0],
                y: args.lidar_tf_quat[1],
                z: args.lidar_tf_quat[2],
                w: args.lidar_tf_quat[3],
            },
        },
    };
    let tf_msg = ZBytes::from(serde_cdr::serialize(&tf_msg)?);
    let tf_enc = Encoding::APPLICATION_CDR.with_schema("geometry_msgs/msg/TransformStamped");
    let tf_task = tokio::spawn(async move {
        if let Err(e) = tf_static(tf_session, tf_msg, tf_enc).await {
            error!("tf_static error: {:?}", e);
        }
    });
    std::mem::drop(tf_task);

    let (tx, rx) = kanal::bounded_async(8);
    let poll_args = args.clone();

    thread::Builder::new()
        .name("poll".to_string())
        .spawn(move || {
            set_process_priority();
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(poll_loop(poll_args, tx)),
                Err(e) => error!("failed to build poll runtime: {}", e),
            }
        })?;

    stream(session, args, rx).await
}

/// Polls the scanner at the configured rate and forwards each scan to the
/// publisher.  Returns after the first connection or protocol failure, or
/// once the publisher has gone away.  Restarting is left to the supervisor.
async fn poll_loop(args: Args, tx: AsyncSender<ScanPoints>) {
    let mut scanner = Scanner::new(ScannerConfig::from(&args));

    if let Err(e) = scanner.connect((args.target.as_str(), args.port)).await {
        error!("connect to {}:{} failed: {}", args.target, args.port, e);
        return;
    }

    match scanner.device_ident().await {
        Ok(ident) => info!("scanner {} firmware {}", ident.name, ident.version),
        Err(e) => {
            report(&args, &e);
            scanner.disconnect();
            return;
        }
    }

    let period = args.poll_interval();
    let mut interval = (!period.is_zero()).then(|| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        if let Some(interval) = interval.as_mut() {
            interval.tick().await;
        }

        let polled = async { scanner.poll().await.map(|frame| frame.scan_counter) }
            .instrument(info_span!("poll"))
            .await;

        match polled {
            Ok(scan_counter) => {
                let scan = ScanPoints {
                    scan_counter,
                    points: scanner.points(),
                    distances: scanner.distances(),
                };
                args.tracy
                    .then(|| plot!("samples", scan.distances.len() as f64));

                if let Err(e) = tx.send(scan).await {
                    error!("publisher closed: {:?}", e);
                    break;
                }
            }
            Err(Error::UnexpectedEndOfSlice(offset)) => {
                warn!("dropping truncated scan at offset {}", offset);
            }
            Err(e) => {
                report(&args, &e);
                break;
            }
        }
    }

    scanner.disconnect();
}

fn report(args: &Args, err: &Error) {
    error!("scanner error: {}", err);
    if let Error::DialectNotAcknowledged { .. } = err {
        warn!(
            "{}:{} did not answer a binary telegram, check that the port is the CoLa-B port",
            args.target, args.port
        );
    }
}

async fn stream(
    session: Session,
    args: Args,
    rx: AsyncReceiver<ScanPoints>,
) -> Result<(), Box<dyn std::error::Error>> {
    let points_publisher = session
        .declare_publisher(args.points_topic.clone())
        .priority(Priority::DataHigh)
        .congestion_control(CongestionControl::Drop)
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    loop {
        let scan = match rx.recv().await {
            Ok(scan) => scan,
            Err(e) => {
                error!("poll thread exited: {:?}", e);
                return Err(e.into());
            }
        };

        let (msg, enc) = format_points(&scan, &args.lidar_frame_id)?;

        let span = info_span!("points_publish", scan_counter = scan.scan_counter);
        async {
            match points_publisher.put(msg).encoding(enc).await {
                Ok(_) => {}
                Err(e) => error!("{} publish error: {:?}", args.points_topic, e),
            }
        }
        .instrument(span)
        .await;

        args.tracy.then(frame_mark);
    }
}

fn point_fields() -> Vec<sensor_msgs::PointField> {
    POINT_FIELDS
        .iter()
        .enumerate()
        .map(|(i, name)| sensor_msgs::PointField {
            name: name.to_string(),
            offset: 4 * i as u32,
            datatype: PointFieldType::FLOAT32 as u8,
            count: 1,
        })
        .collect()
}

/// Interleaves the points with their distances as native-endian x y z
/// distance records.
fn pack_points(points: &Array2<f32>, distances: &Array1<f32>) -> Vec<u8> {
    points
        .outer_iter()
        .zip(distances.iter())
        .flat_map(|(xyz, distance)| [xyz[0], xyz[1], xyz[2], *distance])
        .flat_map(|elem| elem.to_ne_bytes())
        .collect()
}

#[instrument(skip_all, fields(n_points = scan.distances.len()))]
fn format_points(
    scan: &ScanPoints,
    frame_id: &str,
) -> Result<(ZBytes, Encoding), Box<dyn std::error::Error>> {
    let n_points = scan.distances.len() as u32;

    let msg = sensor_msgs::PointCloud2 {
        header: std_msgs::Header {
            stamp: timestamp()?,
            frame_id: frame_id.to_string(),
        },
        height: 1,
        width: n_points,
        fields: point_fields(),
        is_bigendian: cfg!(target_endian = "big"),
        point_step: POINT_STEP,
        row_step: POINT_STEP * n_points,
        data: pack_points(&scan.points, &scan.distances),
        is_dense: true,
    };

    let msg = ZBytes::from(serde_cdr::serialize(&msg)?);
    let enc = Encoding::APPLICATION_CDR.with_schema("sensor_msgs/msg/PointCloud2");

    Ok((msg, enc))
}

async fn tf_static(
    session: Session,
    msg: ZBytes,
    enc: Encoding,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let topic = "rt/tf_static".to_string();
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        interval.tick().await;
        let span = info_span!("tf_static_publish");
        async { session.put(&topic, msg.clone()).encoding(enc.clone()).await }
            .instrument(span)
            .await?;
    }
}
