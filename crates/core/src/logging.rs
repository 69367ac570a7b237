use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(verbose: bool) -> EnvFilter {
    // RUST_LOG, when set, overrides the verbosity switch.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Install the global subscriber. Panics if one is already installed.
pub fn init(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(verbose))
        .init();
}

/// Like [`init`], but returns `false` instead of panicking when a subscriber exists.
pub fn try_init(verbose: bool) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(verbose))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_twice() {
        let _ = try_init(true);
        assert!(!try_init(false));
    }
}
