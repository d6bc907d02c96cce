use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Stderr subscriber for every subcommand; `VIGIL_LOG_FORMAT=json` switches
/// `vigil run` to one JSON object per line.
pub fn init_tracing() {
    let json = std::env::var("VIGIL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder
            .with_ansi(std::io::stderr().is_terminal())
            .compact()
            .try_init()
    };
}
