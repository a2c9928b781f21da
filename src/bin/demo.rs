//! Demo module binary: a few small modules on top of `switchyard-sdk`.
//! Pick one with `module_type` in the host settings.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard_sdk::{InitContext, Module, ModuleLogger, ModuleRegistry, Request, Response, SettingsSaver};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct EchoSettings {
    greeting: String,
    /// When this file appears the module asks to be rebuilt
    #[serde(skip_serializing_if = "Option::is_none")]
    reinit_flag: Option<PathBuf>,
    /// Extra patterns to monitor
    watch: Vec<String>,
}

/// Answers with its greeting and the part of the path below its hook.
#[derive(Default)]
struct Echo {
    settings: EchoSettings,
    saver: Option<SettingsSaver>,
    log: Option<ModuleLogger>,
}

impl Module for Echo {
    fn name(&self) -> String {
        "Echo".into()
    }

    fn init(&mut self, ctx: InitContext) -> anyhow::Result<()> {
        self.settings = ctx.settings_as();
        if self.settings.greeting.is_empty() {
            self.settings.greeting = "echo".into();
        }
        ctx.log.info(format!("Echo '{}' ready (pid {})", ctx.name, std::process::id()));
        self.saver = Some(ctx.saver);
        self.log = Some(ctx.log);
        Ok(())
    }

    fn file_filters_to_monitor(&self) -> Vec<String> {
        self.settings.watch.clone()
    }

    fn handle(&self, req: Request) -> anyhow::Result<Response> {
        if let Some(ms) = req.url.query_param("ms").and_then(|v| v.parse::<u64>().ok()) {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if req.url.query_param("fail").is_some() {
            anyhow::bail!("asked to fail on {}", req.url.path);
        }
        if let Some(greeting) = req.url.query_param("save") {
            let mut next = self.settings.clone();
            next.greeting = greeting.to_string();
            if let Some(saver) = &self.saver {
                saver.save(&next)?;
            }
        }
        Ok(Response::text(format!("{} {}", self.settings.greeting, req.url.sub_path))
            .with_header("x-module-pid", std::process::id().to_string())
            .with_header("x-module-name", self.name()))
    }

    fn must_reinitialize(&self) -> bool {
        match &self.settings.reinit_flag {
            Some(flag) if flag.exists() => {
                let _ = std::fs::remove_file(flag);
                true
            }
            _ => false,
        }
    }

    fn shutdown(&self) {
        if let Some(log) = &self.log {
            log.info("Echo shutting down");
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RedirectSettings {
    target: String,
}

/// Redirects everything below its hook to `target`.
#[derive(Default)]
struct Redirect {
    target: String,
}

impl Module for Redirect {
    fn name(&self) -> String {
        "Redirect".into()
    }

    fn init(&mut self, ctx: InitContext) -> anyhow::Result<()> {
        let settings: RedirectSettings = ctx.settings_as();
        if settings.target.is_empty() {
            anyhow::bail!("redirect target is not configured");
        }
        self.target = settings.target.trim_end_matches('/').to_string();
        Ok(())
    }

    fn handle(&self, req: Request) -> anyhow::Result<Response> {
        Ok(Response::redirect(format!("{}{}", self.target, req.url.sub_path)))
    }
}

/// Always fails in `init`.
#[derive(Default)]
struct FailingInit;

impl Module for FailingInit {
    fn name(&self) -> String {
        "FailingInit".into()
    }

    fn init(&mut self, _ctx: InitContext) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("connection refused").context("cannot reach backing store"))
    }

    fn handle(&self, _req: Request) -> anyhow::Result<Response> {
        Ok(Response::not_found())
    }
}

fn main() -> ExitCode {
    switchyard_sdk::serve(
        ModuleRegistry::new()
            .register::<Echo>("Echo")
            .register::<Redirect>("Redirect")
            .register::<FailingInit>("FailingInit"),
    )
}
