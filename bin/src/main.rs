#![allow(clippy::cognitive_complexity)]
use std::{
    cell::Cell,
    collections::BTreeMap,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;

mod echo;

use echo::EchoProcessor;
use lodestar_core::{
    Driver, DriverConfig,
    config::{cli, routes::RoutesFile, trace},
    coordination::MemoryEnsemble,
    driver::routing::RouterType,
    naming::{CoordinationNamingFactory, NamingType},
    tokio::{self, runtime::Builder, signal},
    tracing::*,
    transport::MemoryTransport,
};

/// lodestar sandbox: a driver over in-process transport and coordination
#[derive(Parser, Debug, Clone)]
#[clap(author, name = "lodestar", bin_name = "lodestar", about, long_about = None)]
struct Args {
    #[clap(flatten)]
    config: cli::Config,
    /// expire every coordination session this often, in ms
    #[clap(long, env, value_parser)]
    simulate_expiry_ms: Option<u64>,
    /// send one call per router this often, in ms
    #[clap(long, env, value_parser, default_value_t = 1_000)]
    heartbeat_ms: u64,
}

fn main() -> Result<()> {
    // parses from cli or environment var
    let args = Args::parse();
    let trace_config = trace::Config::parse(&args.config.lodestar_log)?;
    debug!(?args, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    // the driver is single threaded
    let rt = Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async move {
        match start(args).await {
            Err(err) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

fn load_routes(config: &cli::Config) -> Result<RoutesFile> {
    match &config.routes_path {
        Some(path) => RoutesFile::load(path),
        None => {
            debug!("no routes file, using the echo sandbox routes");
            Ok(RoutesFile {
                static_routes: BTreeMap::from([(
                    "echo".to_owned(),
                    vec!["mem://echo-1".to_owned(), "mem://echo-2".to_owned()],
                )]),
                routers: BTreeMap::from([("echo".to_owned(), RouterType::RoundRobin)]),
            })
        }
    }
}

async fn start(args: Args) -> Result<()> {
    let config = args.config;
    let routes = load_routes(&config)?;

    let ensemble = MemoryEnsemble::new();
    let transport = MemoryTransport::new();
    transport.set_echo(true);

    let mut driver = Driver::new(DriverConfig::from(&config), Box::new(transport));
    driver.set_naming_factory(
        NamingType::Coordination,
        Box::new(CoordinationNamingFactory::new(Arc::new(ensemble.clone()))),
    );

    let default_naming = config.default_naming;
    {
        let naming = driver
            .get_naming(default_naming)
            .with_context(|| format!("failed to start {default_naming} naming"))?;
        for (name, urls) in &routes.static_routes {
            for (i, url) in urls.iter().enumerate() {
                naming
                    .register(name, url, &format!("instance-{i}"))
                    .with_context(|| format!("failed to register {url} for {name}"))?;
            }
            info!(%name, urls = urls.len(), "routes registered");
        }
    }

    let processor = driver.add_processor(Box::new(EchoProcessor::default()));
    for (name, ty) in &routes.routers {
        driver
            .get_router(name, *ty)
            .with_context(|| format!("failed to create router {name}"))?;
        let attached = driver.attach_router(name, processor)?;
        info!(%name, %ty, attached, "router attached");
    }

    let heartbeat = Duration::from_millis(args.heartbeat_ms);
    let expiry = args.simulate_expiry_ms.map(Duration::from_millis);
    let mut next_heartbeat = Instant::now() + heartbeat;
    let mut next_expiry = expiry.map(|every| Instant::now() + every);
    let mut seq = 0_u64;
    let answered = Rc::new(Cell::new(0_u64));

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    info!("lodestar started");
    loop {
        let handled = driver.update();

        let now = Instant::now();
        if now >= next_heartbeat {
            next_heartbeat = now + heartbeat;
            for (name, ty) in &routes.routers {
                seq += 1;
                send_heartbeat(&mut driver, name, *ty, seq, answered.clone());
            }
            debug!(answered = answered.get(), "heartbeat");
        }
        if let (Some(every), Some(at)) = (expiry, next_expiry) {
            if now >= at {
                next_expiry = Some(now + every);
                let expired = ensemble.expire_all_sessions();
                info!(expired, "simulated session expiry");
            }
        }

        let idle = if handled == 0 {
            config.idle_sleep()
        } else {
            Duration::ZERO
        };
        tokio::select! {
            ret = &mut shutdown => {
                ret.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                break;
            }
            _ = tokio::time::sleep(idle) => {}
        }
    }
    Ok(())
}

/// Call the next route of `name` and log the outcome from a task.
fn send_heartbeat(
    driver: &mut Driver,
    name: &str,
    ty: RouterType,
    seq: u64,
    answered: Rc<Cell<u64>>,
) {
    let handle = match driver.get_router(name, ty) {
        Ok(router) => router.route(seq),
        Err(err) => {
            warn!(name, ?err, "router unavailable");
            return;
        }
    };
    let Some(handle) = handle else {
        debug!(name, "no routes, heartbeat skipped");
        return;
    };
    let body = format!("heartbeat {seq}");
    let (id, reply) = driver
        .calls()
        .call(handle, |id| echo::encode(id, body.as_bytes()));
    let name = name.to_owned();
    let spawned = driver.spawn(async move {
        match reply.await {
            Ok(body) => {
                answered.set(answered.get() + 1);
                trace!(%name, %id, len = body.len(), "heartbeat answered");
            }
            Err(err) if err.is_retryable() => debug!(%name, %id, ?err, "heartbeat lost"),
            Err(err) => warn!(%name, %id, ?err, "heartbeat failed"),
        }
    });
    if let Err(err) = spawned {
        error!(?err, "failed to spawn heartbeat task");
    }
}
