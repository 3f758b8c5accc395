use std::sync::Arc;

use clap::Parser;
use sharegate::cli::{
    Args, Secrets, bind_listener, build_sessions, handle_create_admin, init_logging,
    load_secrets, open_database, validate_public_url,
};
use sharegate::presence::{InProcessHub, PresenceBus, RelayBus, relay};
use sharegate::rate_limit::RateLimitConfig;
use sharegate::supervisor::{ProcessLauncher, Supervisor, SupervisorConfig};
use sharegate::worker::{self, WorkerRole};
use sharegate::{ServerConfig, jobs, run_server, server_config, start_presence};
use tracing::{error, info};
use url::Url;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(secrets) = load_secrets(args.secrets_file.as_deref()) else {
        std::process::exit(1);
    };

    let Some(public_url) = validate_public_url(&args.public_url) else {
        std::process::exit(1);
    };

    server_config::init(args.ip_header.clone());

    let role = worker::current();
    if args.workers > 1 && !role.is_worker() {
        run_coordinator(&args, &secrets).await;
    } else {
        run_worker(&args, &secrets, &public_url, role).await;
    }
}

/// Migrate the database, host the presence relay and supervise the workers.
async fn run_coordinator(args: &Args, secrets: &Secrets) {
    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };
    if let Some(login) = &args.create_admin {
        handle_create_admin(&db, login).await;
    }
    drop(db);

    let socket_path = args.relay_socket_path();
    // A previous coordinator may have left its socket behind
    let _ = std::fs::remove_file(&socket_path);
    let listener = tokio::net::UnixListener::bind(&socket_path).unwrap_or_else(|e| {
        error!(path = %socket_path.display(), error = %e, "Failed to bind presence relay");
        std::process::exit(1);
    });
    tokio::spawn(async move {
        if let Err(e) = relay::serve(listener).await {
            error!(error = %e, "Presence relay stopped");
        }
    });

    let launcher = ProcessLauncher::current_exe(std::env::args().skip(1).collect(), secrets.to_env())
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to locate the current executable");
            std::process::exit(1);
        });

    let supervisor = Supervisor::new(
        launcher,
        SupervisorConfig {
            workers: args.workers,
            auto_restart: !args.no_auto_restart,
            max_restarts: args.max_restarts,
        },
    );

    info!(workers = args.workers, port = args.port, "Coordinator started");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };
    let result = supervisor.run_until(shutdown).await;
    let _ = std::fs::remove_file(&socket_path);

    if let Err(e) = result {
        error!(error = %e, "Coordinator stopped");
        std::process::exit(1);
    }
}

async fn run_worker(args: &Args, secrets: &Secrets, public_url: &Url, role: WorkerRole) {
    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    if !role.is_worker()
        && let Some(login) = &args.create_admin
    {
        handle_create_admin(&db, login).await;
    }

    let bus: Box<dyn PresenceBus> = if role.is_worker() {
        let socket_path = args.relay_socket_path();
        let siblings = args.workers.saturating_sub(1);
        match RelayBus::connect(&socket_path, role.worker_id(), siblings).await {
            Ok(bus) => Box::new(bus),
            Err(e) => {
                error!(path = %socket_path.display(), error = %e, "Failed to connect to presence relay");
                std::process::exit(1);
            }
        }
    } else {
        Box::new(InProcessHub::new().join(role.worker_id()))
    };

    let presence = start_presence(bus, &db, args.persist_status);
    if role.runs_scheduler() {
        info!(worker_id = role.worker_id(), "Running scheduled jobs");
        jobs::spawn_scheduler(presence.clone());
    }

    let listener = bind_listener(args.port, role.is_worker()).unwrap_or_else(|e| {
        error!(port = args.port, error = %e, "Failed to bind");
        std::process::exit(1);
    });
    if let Ok(local_addr) = listener.local_addr() {
        info!(address = %local_addr, worker_id = role.worker_id(), "Listening");
    }

    let config = ServerConfig {
        db,
        sessions: Arc::new(build_sessions(secrets, public_url)),
        presence,
        rate_limit: Arc::new(RateLimitConfig::new()),
    };

    if let Err(e) = run_server(config, listener).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
