use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize standard structured logging. Opt-in: library consumers that
/// install their own subscriber should skip this.
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Ignore err when already set
}
