use std::sync::Arc;

use clap::{Parser, Subcommand};

use tgdl::client::broker::ClientBroker;
use tgdl::client::factory::UnavailableFactory;
use tgdl::client::session::SessionStore;
use tgdl::core::settings::Settings;
use tgdl::core::{config, logging};
use tgdl::download::worker;
use tgdl::storage::{db, migrations};
use tgdl::web::server;
use tgdl::Runtime;

#[derive(Parser)]
#[command(name = "tgdl", version, about = "Telegram media download engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine: storage, worker pool and the web control surface
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

fn main() {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(),
        Command::Migrate => migrate(),
    }
}

/// Bootstrap/upgrade the schema. Exit code 0 on success, 1 on failure.
fn migrate() {
    let database_path = config::DATABASE_PATH.as_str();
    let mut conn = match rusqlite::Connection::open(database_path) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("cannot open database {}: {}", database_path, e);
            std::process::exit(1);
        }
    };
    match migrations::run_migrations(&mut conn) {
        Ok(()) => {
            println!("migrations applied to {}", database_path);
        }
        Err(e) => {
            eprintln!("migration failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn serve() {
    if let Err(e) = logging::init_logger(config::LOG_FILE_PATH.as_str()) {
        eprintln!("failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    let runtime_result = tokio::runtime::Runtime::new();
    let tokio_rt = match runtime_result {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    tokio_rt.block_on(async {
        let pool = match db::create_pool(config::DATABASE_PATH.as_str()) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                log::error!("failed to open database: {}", e);
                std::process::exit(1);
            }
        };
        let settings = match Settings::load(&pool) {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("failed to load settings: {}", e);
                std::process::exit(1);
            }
        };

        let sessions = SessionStore::open(config::SESSION_FILE_PATH.as_str());
        let broker = Arc::new(ClientBroker::new(
            Arc::new(UnavailableFactory),
            sessions,
            settings.max_concurrent_transmissions(),
        ));
        let web_port = settings.web_port;
        let runtime = Runtime::new(pool, settings, broker);

        // Leftover staging dirs from a previous run are garbage now.
        runtime.zips.sweep_orphan_temp_dirs(&runtime.settings.zip_staging_root);

        let workers = worker::spawn_workers(&runtime);

        let web_runtime = Arc::clone(&runtime);
        let web = tokio::spawn(async move {
            if let Err(e) = server::start_web_server(web_runtime, web_port).await {
                log::error!("web server exited: {:#}", e);
            }
        });

        shutdown_signal().await;
        log::info!("Stopping...");
        runtime.shutdown();
        for handle in workers {
            let _ = handle.await;
        }
        runtime.broker.disconnect_all().await;
        web.abort();
        log::info!("Stopped!");
    });
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::warn!("cannot install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
