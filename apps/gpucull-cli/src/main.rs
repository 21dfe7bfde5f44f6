mod scene;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gpucull_core::{CullDevice, CullingPipeline, FrameInputs, PipelineConfig, SoftwareDevice};
use gpucull_wgpu::{HeadlessContext, WgpuCullDevice};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::scene::{InstanceGrid, OrbitCamera};

#[derive(Parser)]
#[command(name = "gpucull-cli", about = "Drive the GPU culling pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML pipeline config; flags below override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Frames to render
    #[arg(short, long, default_value = "120")]
    frames: u64,
    /// Instances in the demo grid
    #[arg(short, long, default_value = "1024")]
    instances: usize,
    /// Query ring capacity
    #[arg(long)]
    ring: Option<usize>,
    /// Maximum culling distance
    #[arg(long)]
    view_distance: Option<f32>,
    /// Freeze the culling frustum from this frame on
    #[arg(long)]
    freeze_after: Option<u64>,
    /// Poll telemetry every N frames
    #[arg(long, default_value = "1")]
    poll_every: u64,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and the effective pipeline config
    Info,
    /// Run the pipeline on the CPU reference device
    Simulate {
        #[command(flatten)]
        run: RunArgs,
        /// Submissions before a query result becomes readable
        #[arg(long, default_value = "2")]
        latency: u32,
        /// Fail the staging upload every N frames
        #[arg(long)]
        fail_every: Option<u64>,
    },
    /// Run the pipeline on a headless wgpu device
    Gpu {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value = "1280")]
        width: u32,
        #[arg(long, default_value = "720")]
        height: u32,
    },
}

#[derive(Debug, Serialize)]
struct RunSummary {
    device: &'static str,
    instances: usize,
    frames_submitted: u64,
    frames_skipped: u64,
    recovered_frames: u64,
    lost_frames: u64,
    /// Approximate count from pipeline statistics.
    rendered_instances: Option<u32>,
    /// Exact count read back from the last published draw args.
    published_visible: u32,
}

fn load_config(path: Option<&PathBuf>, run: Option<&RunArgs>) -> anyhow::Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(run) = run {
        let instances = u32::try_from(run.instances).context("instance count too large")?;
        config.instance_capacity = config.instance_capacity.max(instances);
        if let Some(ring) = run.ring {
            config.query_ring_capacity = ring;
        }
        if let Some(distance) = run.view_distance {
            config.max_view_distance = distance;
        }
    }
    config.validate()?;
    Ok(config)
}

fn run_frames<D, F>(
    pipeline: &mut CullingPipeline<D>,
    run: &RunArgs,
    device: &'static str,
    mut before_frame: F,
) -> anyhow::Result<RunSummary>
where
    D: CullDevice,
    F: FnMut(&mut D, u64),
{
    let camera = OrbitCamera::default();
    let projection = camera.projection();
    let lights = scene::lights();
    let mut grid = InstanceGrid::new(run.instances, 3.0);
    let mut skipped = 0;

    for frame in 0..run.frames {
        before_frame(pipeline.device_mut(), frame);
        grid.animate(frame);
        let inputs = FrameInputs {
            view: camera.view(frame),
            projection,
            camera_position: camera.position(frame),
            freeze_frustum: run.freeze_after.is_some_and(|f| frame >= f),
            transforms: grid.transforms(),
            shading: grid.shading(),
            lights: &lights,
        };

        match pipeline.render_frame(&inputs) {
            Ok(report) => tracing::debug!(?report, "frame"),
            Err(err) if err.is_transient() => {
                skipped += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        if run.poll_every > 0 && frame % run.poll_every == 0 {
            if let Some(count) = pipeline.poll_telemetry()? {
                tracing::info!(frame, rendered = count, "telemetry");
            }
        }
    }

    pipeline.drain_telemetry()?;
    let rendered_instances = pipeline.rendered_instances();
    let published = pipeline.read_published()?;
    let telemetry = pipeline.telemetry();
    Ok(RunSummary {
        device,
        instances: run.instances,
        frames_submitted: telemetry.cur_frame(),
        frames_skipped: skipped,
        recovered_frames: telemetry.recovered_frames(),
        lost_frames: telemetry.lost_frames(),
        rendered_instances,
        published_visible: published.args.instance_count,
    })
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("device: {}", summary.device);
    println!(
        "frames: {} submitted, {} skipped",
        summary.frames_submitted, summary.frames_skipped
    );
    println!(
        "telemetry: {} recovered, {} lost",
        summary.recovered_frames, summary.lost_frames
    );
    match summary.rendered_instances {
        Some(n) => println!("rendered (approx): {n} / {}", summary.instances),
        None => println!("rendered (approx): no result yet"),
    }
    println!("published visible: {}", summary.published_visible);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            let config = load_config(cli.config.as_ref(), None)?;
            println!("gpucull-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "kernel: workgroup size {}",
                gpucull_core::kernel::WORKGROUP_SIZE
            );
            println!("config:\n{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            run,
            latency,
            fail_every,
        } => {
            let config = load_config(cli.config.as_ref(), Some(&run))?;
            let device = SoftwareDevice::new(&config, latency)?;
            let mut pipeline = CullingPipeline::new(config, device)?;
            let summary = run_frames(&mut pipeline, &run, "software", |device, frame| {
                if fail_every.is_some_and(|n| n > 0 && frame > 0 && frame % n == 0) {
                    device.fail_next_upload();
                }
            })?;
            print_summary(&summary, run.json)?;
        }
        Commands::Gpu { run, width, height } => {
            let config = load_config(cli.config.as_ref(), Some(&run))?;
            let context = HeadlessContext::new()?;
            println!("adapter: {}", context.adapter_info.name);
            let device = WgpuCullDevice::new(context, &config, width, height)?;
            let mut pipeline = CullingPipeline::new(config, device)?;
            let summary = run_frames(&mut pipeline, &run, "wgpu", |_, _| {})?;
            print_summary(&summary, run.json)?;
        }
    }

    Ok(())
}
