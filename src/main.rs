use std::path::Path;

use anyhow::Context;
use clap::Parser;
use export_bus::{
    ConfigureRequest, ExportBus, ExportEvent, ExportOutput,
    exporter::{self, ExportJob},
    synthetic::SyntheticProbe,
};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

mod cli;
mod pattern;

use cli::{Args, Backend};

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .filter_module("ffmpeg_next", level)
        .filter_module("export_bus", level)
        .init();
}

#[derive(Serialize)]
struct Summary<'a> {
    codec: &'a str,
    width: u32,
    height: u32,
    frame_rate: f64,
    frames: usize,
    bytes: usize,
    key_frames: usize,
    has_descriptor: bool,
}

async fn write_output(dir: &Path, args: &Args, output: &ExportOutput) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;

    tokio::fs::write(dir.join("stream.bin"), &output.buffer)
        .await
        .context("write stream.bin")?;
    let index = serde_json::to_vec_pretty(&output.chunks)?;
    tokio::fs::write(dir.join("chunks.json"), index)
        .await
        .context("write chunks.json")?;
    match &output.descriptor {
        Some(descriptor) => tokio::fs::write(dir.join("descriptor.bin"), descriptor)
            .await
            .context("write descriptor.bin")?,
        None => log::warn!("encoder produced no decoder descriptor"),
    }

    let summary = Summary {
        codec: args.codec.as_deref().unwrap_or("avc1.640034"),
        width: args.width,
        height: args.height,
        frame_rate: args.fps,
        frames: output.chunks.len(),
        bytes: output.total_bytes(),
        key_frames: output.chunks.iter().filter(|c| c.is_key).count(),
        has_descriptor: output.descriptor.is_some(),
    };
    tokio::fs::write(dir.join("summary.json"), serde_json::to_vec_pretty(&summary)?)
        .await
        .context("write summary.json")?;
    Ok(())
}

async fn export(args: &Args, cancel: CancellationToken) -> anyhow::Result<ExportOutput> {
    let bus = match args.backend {
        Backend::Ffmpeg => {
            export_bus::init()?;
            ExportBus::ffmpeg("cli")
        }
        Backend::Synthetic => ExportBus::new("cli", SyntheticProbe::new().factory()),
    };

    let mut events = Box::pin(bus.event_stream());
    let log_chunks = args.chunks;
    let event_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = event_cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(ExportEvent::Error { message }) => log::error!("encoder: {}", message),
                    Some(ExportEvent::Chunk(chunk)) if log_chunks => log::debug!(
                        "chunk ts={} dur={} key={} size={}",
                        chunk.timestamp,
                        chunk.duration,
                        chunk.is_key,
                        chunk.size
                    ),
                    Some(_) => {}
                    None => break,
                },
            }
        }
    });

    let mut request = ConfigureRequest::new(args.bitrate, args.width, args.height, args.fps)
        .with_mode(args.mode.into())
        .with_chunk_stream(args.chunks);
    if let Some(codec) = &args.codec {
        request = request.with_codec(codec);
    }
    request.keyframe_interval = args.keyframe_interval;
    bus.configure(request).await?;

    let job = match args.frames {
        Some(frames) => ExportJob::new(frames, args.fps),
        None => ExportJob::from_duration(args.duration, args.fps),
    }
    .with_max_pending(args.max_pending);

    let mut source = pattern::TestPattern::new(args.width, args.height);
    tokio::select! {
        _ = cancel.cancelled() => anyhow::bail!("export cancelled"),
        output = exporter::run_export(&bus, &mut source, job) => output,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbosity);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let result = match export(&args, cancel.clone()).await {
        Ok(output) => write_output(&args.out_dir, &args, &output).await.map(|_| output),
        Err(e) => Err(e),
    };
    cancel.cancel();

    match result {
        Ok(output) => {
            log::info!(
                "wrote {} chunks ({} bytes) to {}",
                output.chunks.len(),
                output.total_bytes(),
                args.out_dir.display()
            );
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
