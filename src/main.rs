//! Real-time collaboration signaling broker: entry point.

use broker::conf;
use slog::{o, Drain};
use slog_scope::GlobalLoggerGuard;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();

    let (log, _log_guard) = init_logger();
    let conf = conf::load(&log);

    broker::run(conf, log).await
}

/// Initializes the [`slog`] logger: a human-readable [`slog_term`] decorator
/// in development, structured [`slog_json`] in release builds, both wrapped
/// in [`slog_envlogger`] and [`slog_async`]. Also installs it as the process
/// global via [`slog_scope`] and bridges the plain [`log`] facade via
/// [`slog_stdlog`], so dependency code using `log::*` is captured too. The
/// returned guard must be held for the process lifetime; dropping it restores
/// the previous global logger.
fn init_logger() -> (slog::Logger, GlobalLoggerGuard) {
    let logger = if cfg!(debug_assertions) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    } else {
        let drain = slog_json::Json::default(std::io::stdout()).fuse();
        let drain = slog_envlogger::new(drain).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    };

    let guard = slog_scope::set_global_logger(logger.clone());
    slog_stdlog::init().expect("slog_stdlog::init must only be called once");

    (logger, guard)
}
