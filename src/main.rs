// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use route_recorder::bus::IndexPublisher;
use route_recorder::config::{self, RecorderConfig};
use route_recorder::coordinator::Coordinator;
use route_recorder::encoder::{self, ChunkWriter, EncoderConfig};
use route_recorder::ingest::{IngestLoop, Subscription};
use route_recorder::init_data;
use route_recorder::logger::{clear_locks, Logger};
use route_recorder::params::Params;
use route_recorder::vision::SocketFrameSource;
use route_recorder::TcpSubscriber;

const NICE_LEVEL: libc::c_int = -12;
const LOCK_SWEEP_DEPTH: usize = 16;

/// Route Recorder - log every bus topic and camera stream to segments
//
// Unknown flags are tolerated (ignore_errors): older launchers pass flags
// this build no longer knows about.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, ignore_errors = true)]
struct Args {
    /// Write one segment with an init and a boot record, then exit
    #[arg(long)]
    bootlog: bool,

    /// Publish the raw bitstream while recording
    #[arg(long)]
    stream: bool,

    /// Publish the raw bitstream and disable disk logging
    #[arg(long)]
    only_stream: bool,

    /// Path to recorder settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the service list (default: ../service_list.yaml next to the
    /// executable)
    #[arg(long)]
    service_list: Option<PathBuf>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    let service_list_path = args
        .service_list
        .clone()
        .unwrap_or_else(config::default_service_list_path);

    let config = if args.bootlog {
        // bootlog mode has no subscriptions; the service list may not exist
        config::ConfigLoader::load_settings(args.config.as_deref())?
    } else {
        config::load_config(args.config.as_deref(), &service_list_path)?
    };

    init_tracing(&config.logging.level);

    let params = Params::new(&config.recorder.params_root);

    if args.bootlog {
        init_data::run_bootlog(&config.recorder.log_root, &params)?;
        return Ok(());
    }

    // the recorder must not lose the scheduling race against producers
    unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, NICE_LEVEL) };

    clear_locks(&config.recorder.log_root, LOCK_SWEEP_DEPTH);

    let is_streaming = args.stream || args.only_stream;
    let is_logging = !args.only_stream;

    // subscribe to all services
    let mut subs = Vec::new();
    for service in config.services.iter().filter(|s| s.should_log) {
        info!("subscribing to {} at {}", service.name, service.endpoint());
        subs.push(Subscription::new(
            Box::new(TcpSubscriber::connect(service.endpoint())),
            service.name.clone(),
            service.is_frame(),
            service.patch_timestamp(),
            service.qlog_freq,
        ));
    }

    let init_event = init_data::build_init_event(&params)?;
    let logger = Arc::new(Logger::new(
        &config.recorder.log_root,
        "rlog",
        init_event,
        true,
    )?);
    let coordinator = Arc::new(Coordinator::new());

    {
        let coordinator = Arc::clone(&coordinator);
        ctrlc::set_handler(move || coordinator.shutdown())
            .context("failed to install signal handler")?;
    }

    let mut ingest = IngestLoop::new(
        subs,
        Arc::clone(&logger),
        Arc::clone(&coordinator),
        config.recorder.segment_length_seconds,
        is_logging,
    );
    if is_logging {
        ingest.rotate()?;
    }

    let rear = spawn_encoder(
        EncoderConfig {
            stream_name: "rear".to_string(),
            is_front: false,
            bitrate: config.recorder.rear_bitrate,
            raw_clips: config.recorder.raw_clips && is_logging,
        },
        &config,
        config.recorder.rear_index_port,
        is_streaming.then_some(config.recorder.stream_port),
        &config.recorder.rear_frame_socket,
        Arc::clone(&coordinator),
        Arc::clone(&logger),
        params.clone(),
    )?;
    let front = spawn_encoder(
        EncoderConfig {
            stream_name: "front".to_string(),
            is_front: true,
            bitrate: config.recorder.front_bitrate,
            raw_clips: false,
        },
        &config,
        config.recorder.front_index_port,
        None,
        &config.recorder.front_frame_socket,
        Arc::clone(&coordinator),
        Arc::clone(&logger),
        params.clone(),
    )?;

    ingest.run()?;

    info!("joining encoder threads");
    coordinator.shutdown();
    for (name, handle) in [("front", front), ("rear", rear)] {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} encoder exited with error: {}", name, e),
            Err(_) => warn!("{} encoder panicked", name),
        }
    }

    logger.close();
    info!("recorder shut down");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_encoder(
    cfg: EncoderConfig,
    config: &RecorderConfig,
    index_port: u16,
    stream_port: Option<u16>,
    frame_socket: &std::path::Path,
    coordinator: Arc<Coordinator>,
    logger: Arc<Logger>,
    params: Params,
) -> Result<std::thread::JoinHandle<Result<()>>> {
    let index_pub = Some(IndexPublisher::bind(index_port)?);
    let stream_pub = stream_port.map(IndexPublisher::bind).transpose()?;
    let source = Box::new(SocketFrameSource::new(frame_socket));
    let stream_name = cfg.stream_name.clone();
    let bitrate = cfg.bitrate;
    let fps = config.recorder.camera_fps;

    let handle = std::thread::Builder::new()
        .name(format!("{}-encoder", cfg.stream_name))
        .spawn(move || {
            encoder::run_encoder(
                cfg,
                coordinator,
                logger,
                params,
                source,
                Box::new(move |info| {
                    let mut info = *info;
                    if info.fps == 0 {
                        info.fps = fps;
                    }
                    let codec = ChunkWriter::new(&stream_name, &info, bitrate);
                    Ok(Box::new(codec) as Box<dyn route_recorder::FrameCodec>)
                }),
                index_pub,
                stream_pub,
            )
        })
        .context("failed to spawn encoder thread")?;
    Ok(handle)
}
