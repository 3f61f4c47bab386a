// Command line
//
// `loader -M <manifest> [-s] [-F] [-S] [-l <gib>] [-v <level>] [-Q] [-P]`.
// `-M` is required exactly once; clap's default "last one wins" for a
// repeated option isn't what the external contract wants, so a second
// `-M` is rejected by hand rather than silently accepted.

use std::path::PathBuf;

use clap::Parser;

use crate::error::LoaderError;

#[derive(Debug, Parser)]
#[command(name = "loader", about = "Single-process sandbox loader")]
pub struct Cli {
    /// Manifest file to load.
    #[arg(short = 'M', action = clap::ArgAction::Append)]
    manifest: Vec<PathBuf>,

    /// Skip code validation; record verdict 2.
    #[arg(short = 's')]
    pub skip_validation: bool,

    /// Load and validate but do not execute.
    #[arg(short = 'F')]
    pub fuzz_load: bool,

    /// Disable signal handling.
    #[arg(short = 'S')]
    pub disable_signals: bool,

    /// Cap total storage use, in GiB.
    #[arg(short = 'l')]
    pub storage_limit_gib: Option<u64>,

    /// Verbosity level for the log.
    #[arg(short = 'v', default_value_t = 0)]
    pub verbosity: u8,

    /// Skip platform qualification tests.
    #[arg(short = 'Q')]
    pub skip_qualification: bool,

    /// Disable disk-space preallocation by the channel layer.
    #[arg(short = 'P')]
    pub no_preallocate: bool,
}

/// Fully resolved configuration, after the single-`-M` invariant has
/// been checked.
#[derive(Debug, Clone)]
pub struct Config {
    pub manifest_path: PathBuf,
    pub skip_validation: bool,
    pub fuzz_load: bool,
    pub disable_signals: bool,
    pub storage_limit_gib: Option<u64>,
    pub verbosity: u8,
    pub skip_qualification: bool,
    pub no_preallocate: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, LoaderError> {
        let manifest_path = match self.manifest.len() {
            0 => return Err(LoaderError::BadCmdline("missing required -M <manifest>".into())),
            1 => self.manifest.into_iter().next().unwrap(),
            n => {
                return Err(LoaderError::BadCmdline(format!(
                    "-M given {n} times, expected exactly once"
                )))
            }
        };

        Ok(Config {
            manifest_path,
            skip_validation: self.skip_validation,
            fuzz_load: self.fuzz_load,
            disable_signals: self.disable_signals,
            storage_limit_gib: self.storage_limit_gib,
            verbosity: self.verbosity,
            skip_qualification: self.skip_qualification,
            no_preallocate: self.no_preallocate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_manifest() {
        let cli = Cli::parse_from(["loader"]);
        assert!(matches!(cli.into_config(), Err(LoaderError::BadCmdline(_))));
    }

    #[test]
    fn single_manifest_is_accepted() {
        let cli = Cli::parse_from(["loader", "-M", "a.mft"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.manifest_path, PathBuf::from("a.mft"));
    }

    #[test]
    fn duplicate_manifest_is_rejected() {
        let cli = Cli::parse_from(["loader", "-M", "a.mft", "-M", "b.mft"]);
        assert!(matches!(cli.into_config(), Err(LoaderError::BadCmdline(_))));
    }

    #[test]
    fn flags_and_options_round_trip() {
        let cli = Cli::parse_from(["loader", "-M", "a.mft", "-s", "-F", "-l", "4", "-v", "3"]);
        let config = cli.into_config().unwrap();
        assert!(config.skip_validation);
        assert!(config.fuzz_load);
        assert_eq!(config.storage_limit_gib, Some(4));
        assert_eq!(config.verbosity, 3);
    }
}
