// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bidpilot=debug")),
        )
        .with_test_writer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}
