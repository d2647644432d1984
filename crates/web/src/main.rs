use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use gtfsrt::{FeedAssembler, FeedPublisher, PublisherConfig};
use iom::dispatcher::{VehicleDispatcher, DEFAULT_POOL_SIZE, DEFAULT_QUEUE_CAPACITY};
use iom::events::EventStream;
use iom::handlers::{HandlerContext, IomHandler, MatchingConfig};
use iom::{IomClient, IomConfig};
use nominal::NominalClient;
use storage::{GnssWindow, ObjectStore, PgStore, StoreConnectionInfo};
use tokio::sync::watch;
use web::{start_web_server, WebState};

#[tokio::main]
async fn main() -> ExitCode {
    if is_debug() {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(why) => {
            log::error!("avl2gtfsrt: {}", why);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // storage
    let connection_info = StoreConnectionInfo::from_env()
        .ok_or("expected database connection info in A2G_DATABASE_* environment")?;
    let window = GnssWindow::from_env();
    let storage: Arc<dyn ObjectStore> =
        Arc::new(PgStore::connect(connection_info, window).await?);

    // schedule source
    let nominal = Arc::new(NominalClient::from_env()?);

    // inbound bus
    let iom_config = IomConfig::from_env()?;
    let (iom_client, eventloop) = IomClient::connect(&iom_config);

    let events = EventStream::default();
    let handler = IomHandler::new(HandlerContext {
        storage: storage.clone(),
        nominal,
        matching: MatchingConfig::from_env(),
        events: events.clone(),
        publisher: iom_client.publisher(),
        topics: iom_client.topics.clone(),
    });
    let dispatcher = VehicleDispatcher::new(handler, DEFAULT_POOL_SIZE, DEFAULT_QUEUE_CAPACITY);

    // feeds
    let assembler = Arc::new(FeedAssembler::from_env(storage.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // differential publisher, optional collaborator
    let publisher_task = PublisherConfig::from_env().map(|config| {
        let publisher = FeedPublisher::new(assembler.clone(), config);
        let events = events.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { publisher.run(events, shutdown).await })
    });

    // http server
    let http_port: u16 = env::var("A2G_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(9000);
    let web_state = WebState {
        assembler: assembler.clone(),
    };
    let web_task = tokio::spawn(async move {
        if let Err(why) = start_web_server(web_state, http_port).await {
            log::error!("avl2gtfsrt: web server failed: {}", why);
        }
    });

    // bus loop until SIGINT/SIGTERM
    let bus_task = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { iom_client.run(eventloop, dispatcher, shutdown).await })
    };

    wait_for_shutdown_signal().await;
    log::info!("avl2gtfsrt: received shutdown signal");

    // stop accepting bus events, drain the workers, close storage last
    let _ = shutdown_tx.send(true);
    let _ = bus_task.await;
    if let Some(task) = publisher_task {
        let _ = task.await;
    }
    web_task.abort();

    storage.close().await;
    log::info!("avl2gtfsrt: shutdown complete");

    Ok(())
}

fn is_debug() -> bool {
    env::var("A2G_DEBUG")
        .map(|value| {
            let value = value.to_lowercase();
            value == "true" || value == "1"
        })
        .unwrap_or(false)
}

async fn wait_for_shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(why) => {
                log::error!("avl2gtfsrt: cannot install SIGTERM handler: {}", why);
                let _ = interrupt.await;
                return;
            }
        };

        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}
