use std::process::ExitCode;

use clap::Parser;

use switchyard::cli::{Action, Cli};
use switchyard::settings::{self, Settings};
use switchyard::{logging, service, Engine, EngineOptions};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings_path = settings::resolve_settings_path(cli.settings.as_deref());

    // 로그 설정만 먼저 읽음. 엔진이 첫 tick에서 다시 로드
    let log = Settings::load(&settings_path).map(|s| s.log).unwrap_or_default();
    logging::init(&log);

    match cli.action {
        Action::Run | Action::Service => run(settings_path),
        action => match service::control(action, &settings_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("{:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn run(settings_path: std::path::PathBuf) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        tracing::info!("switchyard starting with settings {}", settings_path.display());
        let engine = Engine::new(settings_path, EngineOptions::from_env());
        match engine.run_until(shutdown_signal()).await {
            Ok(()) => {
                tracing::info!("switchyard stopped");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("switchyard stopped: {}", e);
                ExitCode::FAILURE
            }
        }
    })
}

/// Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
