use std::str::FromStr;

pub mod sim_clock;

static INIT: std::sync::Once = std::sync::Once::new();

/// Install the test tracing subscriber once per process. Controlled by
/// `RUST_LOG`.
pub fn set_up() {
    INIT.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_test_writer(),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}

pub fn env_or_default<T: FromStr>(env_var: &str, default: T) -> T {
    std::env::var(env_var)
        .ok()
        .and_then(|val| str::parse(&val).ok())
        .unwrap_or(default)
}
