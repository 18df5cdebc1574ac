use anyhow::Context as _;

/// Log verbosity requested on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    pub verbose: u8,
    pub quiet: bool,
}

impl Verbosity {
    /// Filter used when `RUST_LOG` is unset. `-v` opens up this crate only, so provider
    /// and HTTP internals stay quiet until `-vv`.
    pub fn default_filter(self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "info,novel_translator=debug",
            (false, _) => "debug,novel_translator=trace",
        }
    }
}

/// Logs go to stderr so `chapters`/`scan` output on stdout stays clean. `RUST_LOG` wins
/// over the verbosity flags.
pub fn init(verbosity: Verbosity) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(verbosity.default_filter()))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity.verbose > 1)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pick_the_default_filter() {
        assert_eq!(Verbosity::default().default_filter(), "info");
        let verbose = Verbosity {
            verbose: 1,
            quiet: false,
        };
        assert_eq!(verbose.default_filter(), "info,novel_translator=debug");
        let quiet = Verbosity {
            verbose: 3,
            quiet: true,
        };
        assert_eq!(quiet.default_filter(), "warn");
    }
}
