use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "Extensible HTTP host with hot-swappable modules")]
pub struct Cli {
    /// What to do
    #[arg(value_enum, default_value_t = Action::Run)]
    pub action: Action,

    /// Settings file (defaults to $SWITCHYARD_SETTINGS or the per-user config directory)
    #[arg(short = 's', long = "settings", value_name = "PATH")]
    pub settings: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run in the foreground until Ctrl-C
    #[value(alias = "r")]
    Run,
    /// Register the background service
    #[value(alias = "i")]
    Install,
    /// Remove the background service
    #[value(alias = "u")]
    Uninstall,
    /// Start the background service
    #[value(alias = "s")]
    Start,
    /// Stop the background service
    #[value(alias = "st")]
    Stop,
    /// Entry point used by the service manager
    #[value(hide = true)]
    Service,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run() {
        let cli = Cli::try_parse_from(["switchyard"]).unwrap();
        assert_eq!(cli.action, Action::Run);
        assert!(cli.settings.is_none());
    }

    #[test]
    fn short_aliases_and_settings_option() {
        let cli = Cli::try_parse_from(["switchyard", "st", "-s", "/etc/sy.json"]).unwrap();
        assert_eq!(cli.action, Action::Stop);
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/sy.json")));

        let cli = Cli::try_parse_from(["switchyard", "i", "--settings", "x.json"]).unwrap();
        assert_eq!(cli.action, Action::Install);

        let cli = Cli::try_parse_from(["switchyard", "service"]).unwrap();
        assert_eq!(cli.action, Action::Service);
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(Cli::try_parse_from(["switchyard", "explode"]).is_err());
    }
}
