//! Optional tracing setup for hosts without their own subscriber

/// Install a fmt subscriber filtered at `level`.
///
/// `RUST_LOG` takes precedence when set. Calling this more than once, or
/// after the host installed its own subscriber, is harmless.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("debug");
        init_tracing("not a valid directive [");
        tracing::debug!("still logging");
    }
}
