//! The metrics router binary: wire the components together and run.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use influxdb_client::{InfluxClient, WriteGate};
use observability_deps::tracing::{error, info};
use query_api::{ApiContext, HttpDelegate, ResponseCache};
use registry_client::Client as RegistryClient;
use router::{PointsHandlerFactory, Resolver, RouteCache};
use tokio_util::sync::CancellationToken;

mod config;
mod logging;

use config::Config;

#[derive(Debug, Parser)]
#[clap(
    name = "metrics_router",
    about = "Routes metric batches from the message bus into the time series backends"
)]
struct Args {
    /// Path of the TOML config file.
    #[clap(short = 'c', long = "config", default_value = "./conf/router.conf")]
    config: std::path::PathBuf,
}

fn main() {
    let args = Args::parse();
    println!("load config from {}", args.config.display());

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("read config file failed:\n{e}");
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("init logging failed:\n{e}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building the tokio runtime");

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error=%e, "router failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = CancellationToken::new();
    let addr = config.listen_addr()?;

    let registry = RegistryClient::new(config.registry.link.clone());
    let resolver = Resolver::new(
        registry.clone(),
        config.common.db_ns.clone(),
        config.common.default_db_cluster.clone(),
    );

    let (routes, purge_rx) = RouteCache::new(resolver, config.nsq.topic_prefix.clone());
    tokio::spawn(routes.clone().run_refresher(
        purge_rx,
        Duration::from_secs(config.registry.expire_dur),
        shutdown.child_token(),
    ));

    let gate = WriteGate::new(config.common.write_concurrency);
    let influx = InfluxClient::new(config.backend_config(), gate, routes.purge_handle());

    if config.nsq.enable {
        let factory = Arc::new(PointsHandlerFactory::new(
            routes.clone(),
            Arc::clone(&influx),
        ));
        let (master, _reload) = bus::TopicMaster::new(config.master_config(), factory);
        tokio::spawn(master.run(shutdown.child_token()));
    } else {
        info!("bus consumption disabled");
    }

    let cache = ResponseCache::new();
    cache.spawn_purger(query_api::cache::PURGE_INTERVAL, shutdown.child_token());

    let delegate = HttpDelegate::new(Arc::new(ApiContext {
        routes,
        influx,
        registry,
        cache,
        config: config.api_config(),
    }));

    let server = query_api::http::serve(addr, delegate, shutdown.child_token());
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shutdown.cancel();
            server.await?;
        }
    }

    Ok(())
}
