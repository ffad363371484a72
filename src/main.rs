//! Host executable
//!
//! ```text
//! hotswap-host [config.toml] [--frames N] [--dump-schema]
//! ```

use anyhow::{bail, Context, Result};

use hotswap_engine::config::DEFAULT_CONFIG_FILE;
use hotswap_engine::{Behavior, HeadlessDevice, Host, HostConfig, ModuleLoader, Phase, World};

/// Requests quit after a fixed number of rendered frames
struct FrameBudget {
    remaining: u64,
}

impl Behavior for FrameBudget {
    fn phase(&self) -> Phase {
        Phase::Render
    }

    fn name(&self) -> &str {
        "frame budget"
    }

    fn update(&mut self, world: &mut World, _delta_time: f32) {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            world.request_quit();
        }
    }
}

struct Args {
    config: String,
    frames: Option<u64>,
    dump_schema: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: DEFAULT_CONFIG_FILE.to_string(),
        frames: None,
        dump_schema: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dump-schema" => args.dump_schema = true,
            "--frames" => {
                let value = iter.next().context("--frames needs a count")?;
                let frames = value
                    .parse()
                    .with_context(|| format!("invalid frame count {}", value))?;
                args.frames = Some(frames);
            }
            flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
            path => args.config = path.to_string(),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let config =
        HostConfig::load(&args.config).with_context(|| format!("loading {}", args.config))?;
    log::info!(
        "Package {} from {}",
        config.hot_reload.package,
        config.hot_reload.resolved_plugin_dir().display()
    );

    let loader = ModuleLoader::new(
        config.hot_reload.resolved_plugin_dir(),
        config.hot_reload.package.as_str(),
    )?;
    let device = Box::new(HeadlessDevice::new(config.graphics.backend));
    let mut host = Host::new(config, loader, device);

    if let Some(frames) = args.frames {
        host.add_builtin(Box::new(FrameBudget { remaining: frames.max(1) }));
    }
    host.init()?;

    if args.dump_schema {
        let manifests: Vec<_> =
            host.world().registry().iter().map(|d| d.manifest.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        host.shutdown();
        return Ok(());
    }

    host.start_hot_reload();
    let result = host.run();
    host.shutdown();
    result?;
    Ok(())
}
