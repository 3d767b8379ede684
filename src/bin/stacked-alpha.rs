use std::{cell::RefCell, path::PathBuf, rc::Rc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use stacked_alpha::{
    AutoPause, BackendKind, BackendMode, ElementId, FrameSequence, KitConfig, ManualFrameClock,
    MediaSource, Playable, VideoFrame, ViewportObserver, VisibilityScheduler,
    create_renderer_with_fallback, decode_stacked_image, fallback_factory, shared_surface,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stacked-alpha", version)]
struct Cli {
    /// Log lifecycle events (equivalent to RUST_LOG=stacked_alpha=debug).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode one stacked image into a transparent PNG.
    Frame(FrameArgs),
    /// Drive many players sharing one context through a scrolling viewport.
    Stress(StressArgs),
}

#[derive(Parser, Debug)]
struct FrameArgs {
    /// Stacked input image (color on top, alpha below).
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    /// Backend to use. Falls back to cpu if unavailable.
    #[arg(long, value_enum, default_value_t = BackendKind::Cpu)]
    backend: BackendKind,

    /// Composite premultiplied (the PNG is always written with straight alpha).
    #[arg(long)]
    premultiplied: bool,
}

#[derive(Parser, Debug)]
struct StressArgs {
    /// Number of player instances.
    #[arg(long, default_value_t = 300)]
    instances: u32,

    /// Number of display frames to simulate.
    #[arg(long, default_value_t = 120)]
    frames: u32,

    /// Override the configured backend order with a single backend (plus cpu fallback).
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// KitConfig JSON file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Grid columns.
    #[arg(long, default_value_t = 10)]
    columns: u32,

    /// Viewport scroll per frame, in pixels.
    #[arg(long, default_value_t = 24.0)]
    scroll: f64,
}

const TILE: u32 = 64;
const VIEWPORT_W: f64 = 640.0;
const VIEWPORT_H: f64 = 360.0;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Command::Frame(args) => cmd_frame(args),
        Command::Stress(args) => cmd_stress(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("stacked_alpha=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn modes_for(kind: BackendKind) -> anyhow::Result<Vec<BackendMode>> {
    let cfg = KitConfig {
        backends: vec![kind, BackendKind::Cpu],
        ..KitConfig::default()
    };
    cfg.validate()?;
    Ok(cfg.backend_modes())
}

fn cmd_frame(args: FrameArgs) -> anyhow::Result<()> {
    let bytes = std::fs::read(&args.in_path)
        .with_context(|| format!("read input '{}'", args.in_path.display()))?;
    let frame = decode_stacked_image(&bytes)?;

    let surface = shared_surface();
    let modes = modes_for(args.backend)?;
    let mut renderer = create_renderer_with_fallback(surface.clone(), args.premultiplied, &modes)?;

    let outcome = renderer.draw_video_frame(&frame);
    if !outcome.is_drawn() {
        anyhow::bail!(
            "could not decode {}x{} frame: {outcome:?}",
            frame.width,
            frame.height
        );
    }

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }

    let surface = surface.borrow();
    image::save_buffer_with_format(
        &args.out,
        &surface.to_straight_rgba8(),
        surface.width(),
        surface.height(),
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("write png '{}'", args.out.display()))?;

    eprintln!(
        "wrote {} ({}x{}, backend {})",
        args.out.display(),
        surface.width(),
        surface.height(),
        renderer.backend()
    );
    Ok(())
}

fn demo_frame(phase: u32) -> anyhow::Result<VideoFrame> {
    let mut straight = Vec::with_capacity((TILE * TILE * 4) as usize);
    for y in 0..TILE {
        for x in 0..TILE {
            let dx = x as i32 - (TILE / 2) as i32;
            let dy = y as i32 - (TILE / 2) as i32;
            let r2 = (dx * dx + dy * dy) as u32;
            let a = 255u32.saturating_sub(r2 * 255 / ((TILE / 2) * (TILE / 2))) as u8;
            straight.extend_from_slice(&[(x * 4) as u8, (phase * 16) as u8, (y * 4) as u8, a]);
        }
    }
    Ok(VideoFrame::stack(TILE, TILE, &straight)?)
}

fn cmd_stress(args: StressArgs) -> anyhow::Result<()> {
    let mut cfg = match &args.config {
        Some(path) => KitConfig::from_json_file(path)?,
        None => KitConfig::default(),
    };
    cfg.apply_env()?;
    if let Some(kind) = args.backend {
        cfg.backends = vec![kind, BackendKind::Cpu];
    }
    cfg.validate()?;

    #[cfg(feature = "gpu")]
    let pool = stacked_alpha::gpu_context_pool();
    #[cfg(feature = "gpu")]
    let modes = cfg.backend_modes_with_pool(&pool);
    #[cfg(not(feature = "gpu"))]
    let modes = cfg.backend_modes();

    let frames = (0..8).map(demo_frame).collect::<anyhow::Result<Vec<_>>>()?;
    let clock = Rc::new(ManualFrameClock::new());
    let factory = fallback_factory(modes);
    let autopause = AutoPause::new();

    let columns = args.columns.max(1);
    let mut layout = Vec::with_capacity(args.instances as usize);
    let mut sources = Vec::with_capacity(args.instances as usize);
    let mut schedulers = Vec::with_capacity(args.instances as usize);
    for i in 0..args.instances {
        let id = ElementId(u64::from(i));
        let seq = Rc::new(FrameSequence::new(frames.clone(), 30.0)?);
        seq.set_looping(true);
        seq.seek(f64::from(i % 8) / 30.0);
        seq.play();

        let sched = VisibilityScheduler::new(
            seq.clone(),
            shared_surface(),
            &clock,
            factory.clone(),
            cfg.scheduler_options(),
        );
        autopause.track(id, seq.clone());

        let col = f64::from(i % columns);
        let row = f64::from(i / columns);
        let tile = f64::from(TILE);
        layout.push((
            id,
            kurbo::Rect::new(col * tile, row * tile, (col + 1.0) * tile, (row + 1.0) * tile),
        ));
        sources.push(seq);
        schedulers.push(sched);
    }

    let schedulers = Rc::new(RefCell::new(schedulers));
    let sink = Rc::clone(&schedulers);
    let observer = ViewportObserver::new(move |entries| {
        let schedulers = sink.borrow();
        for e in entries {
            if let Some(s) = schedulers.get(e.target.0 as usize) {
                s.set_intersecting(e.is_intersecting);
            }
        }
    });
    for (id, _) in &layout {
        observer.observe(*id);
    }

    let content_h = f64::from(args.instances.div_ceil(columns) * TILE);
    let mut peak_visible = 0usize;
    for frame in 0..args.frames {
        let top = (f64::from(frame) * args.scroll) % content_h.max(1.0);
        let viewport = kurbo::Rect::new(0.0, top, VIEWPORT_W, top + VIEWPORT_H);

        if let Some(ap) = autopause.observer() {
            ap.observe_layout(viewport, &layout);
        }
        observer.observe_layout(viewport, &layout);

        for seq in &sources {
            seq.advance();
        }
        clock.tick();

        let visible = schedulers
            .borrow()
            .iter()
            .filter(|s| s.is_loop_running())
            .count();
        peak_visible = peak_visible.max(visible);
    }

    let schedulers = schedulers.borrow();
    let draws: u64 = schedulers.iter().map(|s| s.draws()).sum();
    let drawn_instances = schedulers.iter().filter(|s| s.draws() > 0).count();
    let paused = sources.iter().filter(|s| s.paused()).count();
    let backends: std::collections::BTreeSet<String> = schedulers
        .iter()
        .filter_map(|s| s.renderer_backend())
        .map(|k| k.to_string())
        .collect();

    println!("instances:        {}", args.instances);
    println!("frames:           {}", args.frames);
    println!("draws:            {draws}");
    println!("instances drawn:  {drawn_instances}");
    println!("peak playing:     {peak_visible}");
    println!("paused at end:    {paused}");
    println!(
        "backends:         {}",
        backends.into_iter().collect::<Vec<_>>().join(",")
    );
    #[cfg(feature = "gpu")]
    println!(
        "gpu pool:         leases={} created={} destroyed={}",
        pool.live_leases(),
        pool.contexts_created(),
        pool.contexts_destroyed()
    );

    for s in schedulers.iter() {
        s.destroy();
    }
    for (id, _) in &layout {
        autopause.untrack(*id);
    }
    Ok(())
}
