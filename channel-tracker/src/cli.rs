//! Command line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, env = "CBT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Override a setting, e.g. `--set number_of_slots=4` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Write the overridden settings back to the configuration file
    #[arg(long)]
    pub save: bool,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Less log output
    #[arg(short, long, action = ArgAction::Count)]
    pub quiet: u8,
}

impl Args {
    /// Net verbosity: positive is chattier, negative quieter.
    pub fn verbosity(&self) -> i8 {
        self.verbose.min(3) as i8 - self.quiet.min(3) as i8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let args = Args::try_parse_from([
            "cbt",
            "--config",
            "/etc/cbt.toml",
            "--set",
            "number_of_slots=4",
            "--set",
            "minimum_duration=10",
            "--save",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/cbt.toml"));
        assert_eq!(args.overrides, vec!["number_of_slots=4", "minimum_duration=10"]);
        assert!(args.save);
        assert_eq!(args.verbosity(), 2);
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["cbt", "-v", "-q"]).is_err());
        let args = Args::try_parse_from(["cbt", "-q"]).unwrap();
        assert_eq!(args.verbosity(), -1);
    }
}
