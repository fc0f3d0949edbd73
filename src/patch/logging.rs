/// Leveled diagnostics sink for patch runs
///
/// The engine reports its progress (which patches apply where, which access strategy was picked
/// for each member) and every failure through this trait.
pub trait PatchLogger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);

    /// Failure that aborts patching of a class
    fn critical(&self, message: &str);
}

/// Forwards to the `log` facade
#[derive(Copy, Clone, Debug, Default)]
pub struct LogFacade;

impl PatchLogger for LogFacade {
    fn debug(&self, message: &str) {
        log::debug!("{}", message);
    }

    fn info(&self, message: &str) {
        log::info!("{}", message);
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", message);
    }

    fn error(&self, message: &str) {
        log::error!("{}", message);
    }

    fn critical(&self, message: &str) {
        log::error!(target: "bytepatch::critical", "{}", message);
    }
}

/// Discards everything
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopLogger;

impl PatchLogger for NoopLogger {
    fn debug(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn critical(&self, _message: &str) {}
}
