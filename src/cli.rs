use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments for the role steward bot.
#[derive(Parser, Debug)]
#[command(name = "discord-role-steward")]
#[command(about = "Discord bot for role requests, auto-roles and temporary roles")]
#[command(version)]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Overrides `logging.level` from the configuration file
    #[arg(long)]
    pub log_level: Option<String>,

    /// Apply database migrations and exit
    #[arg(long)]
    pub migrate_only: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::CliArgs;

    #[test]
    fn parses_overrides() {
        let args = CliArgs::parse_from([
            "discord-role-steward",
            "--config",
            "/etc/steward.yaml",
            "--log-level",
            "debug",
            "--migrate-only",
        ]);
        assert_eq!(args.config.to_str(), Some("/etc/steward.yaml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.migrate_only);
    }
}
