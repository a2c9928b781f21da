//! Background service control through the platform service manager.
//!
//! - Linux: a systemd unit in `/etc/systemd/system`, driven with `systemctl`
//! - Windows: `sc.exe`

use std::path::Path;
#[cfg(target_os = "linux")]
use std::path::PathBuf;
#[cfg(any(target_os = "linux", target_os = "windows"))]
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::cli::Action;

pub const SERVICE_NAME: &str = "switchyard";

pub fn control(action: Action, settings_path: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("Cannot determine the switchyard executable path")?;
    match action {
        Action::Install => install(&exe, settings_path),
        Action::Uninstall => uninstall(),
        Action::Start => start(),
        Action::Stop => stop(),
        Action::Run | Action::Service => bail!("'{:?}' is not a service control action", action),
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
fn run_manager((program, args): (&str, Vec<String>)) -> Result<()> {
    tracing::info!("Running {} {}", program, args.join(" "));
    let status = Command::new(program)
        .args(&args)
        .status()
        .with_context(|| format!("Failed to run {}", program))?;
    if !status.success() {
        bail!("{} {} failed with {}", program, args.join(" "), status);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn unit_path() -> PathBuf {
    PathBuf::from("/etc/systemd/system").join(format!("{}.service", SERVICE_NAME))
}

/// systemd unit running `switchyard service -s <settings>`.
pub fn unit_file(exe: &Path, settings_path: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=switchyard module host\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart=\"{}\" service --settings \"{}\"\n\
         Restart=on-failure\n\
         KillSignal=SIGINT\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe.display(),
        settings_path.display()
    )
}

#[cfg(target_os = "linux")]
fn install(exe: &Path, settings_path: &Path) -> Result<()> {
    let unit = unit_path();
    std::fs::write(&unit, unit_file(exe, settings_path))
        .with_context(|| format!("Failed to write {}", unit.display()))?;
    run_manager(("systemctl", vec!["daemon-reload".into()]))?;
    run_manager(("systemctl", vec!["enable".into(), SERVICE_NAME.into()]))?;
    tracing::info!("Service '{}' installed", SERVICE_NAME);
    Ok(())
}

#[cfg(target_os = "linux")]
fn uninstall() -> Result<()> {
    // 이미 멈춰 있을 수 있음
    let _ = run_manager(("systemctl", vec!["stop".into(), SERVICE_NAME.into()]));
    run_manager(("systemctl", vec!["disable".into(), SERVICE_NAME.into()]))?;
    let unit = unit_path();
    if unit.exists() {
        std::fs::remove_file(&unit).with_context(|| format!("Failed to remove {}", unit.display()))?;
    }
    run_manager(("systemctl", vec!["daemon-reload".into()]))?;
    tracing::info!("Service '{}' uninstalled", SERVICE_NAME);
    Ok(())
}

#[cfg(target_os = "linux")]
fn start() -> Result<()> {
    run_manager(("systemctl", vec!["start".into(), SERVICE_NAME.into()]))
}

#[cfg(target_os = "linux")]
fn stop() -> Result<()> {
    run_manager(("systemctl", vec!["stop".into(), SERVICE_NAME.into()]))
}

#[cfg(target_os = "windows")]
fn install(exe: &Path, settings_path: &Path) -> Result<()> {
    let bin_path = format!("\"{}\" service --settings \"{}\"", exe.display(), settings_path.display());
    run_manager((
        "sc.exe",
        vec![
            "create".into(),
            SERVICE_NAME.into(),
            "binPath=".into(),
            bin_path,
            "start=".into(),
            "auto".into(),
        ],
    ))
}

#[cfg(target_os = "windows")]
fn uninstall() -> Result<()> {
    let _ = run_manager(("sc.exe", vec!["stop".into(), SERVICE_NAME.into()]));
    run_manager(("sc.exe", vec!["delete".into(), SERVICE_NAME.into()]))
}

#[cfg(target_os = "windows")]
fn start() -> Result<()> {
    run_manager(("sc.exe", vec!["start".into(), SERVICE_NAME.into()]))
}

#[cfg(target_os = "windows")]
fn stop() -> Result<()> {
    run_manager(("sc.exe", vec!["stop".into(), SERVICE_NAME.into()]))
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn install(_exe: &Path, _settings_path: &Path) -> Result<()> {
    bail!("Service installation is not supported on this platform")
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn uninstall() -> Result<()> {
    bail!("Service removal is not supported on this platform")
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn start() -> Result<()> {
    bail!("Service control is not supported on this platform")
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn stop() -> Result<()> {
    bail!("Service control is not supported on this platform")
}
