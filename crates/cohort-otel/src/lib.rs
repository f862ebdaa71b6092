//! Tracing subscriber setup shared by cohort binaries.

use std::path::{Path, PathBuf};

use cohort_core::util::{env_bool, env_string};
use once_cell::sync::OnceCell;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Where the optional rolling coordination log goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollingLog {
    pub dir: PathBuf,
    pub prefix: String,
    pub rotation: Rotation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }

    fn appender(&self, dir: &Path, prefix: &str) -> RollingFileAppender {
        match self {
            Rotation::Minutely => tracing_appender::rolling::minutely(dir, prefix),
            Rotation::Hourly => tracing_appender::rolling::hourly(dir, prefix),
            Rotation::Daily => tracing_appender::rolling::daily(dir, prefix),
        }
    }
}

impl RollingLog {
    /// `COHORT_LOG_ROLL=1` enables the file; `COHORT_LOG_DIR`
    /// (falling back to `COHORT_STATE_DIR/logs`), `COHORT_LOG_PREFIX` and
    /// `COHORT_LOG_ROTATION` tune it.
    pub fn from_env() -> Option<Self> {
        if !env_bool("COHORT_LOG_ROLL").unwrap_or(false) {
            return None;
        }
        let dir = env_string("COHORT_LOG_DIR")
            .map(PathBuf::from)
            .or_else(|| env_string("COHORT_STATE_DIR").map(|d| PathBuf::from(d).join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"));
        Some(Self {
            dir,
            prefix: env_string("COHORT_LOG_PREFIX").unwrap_or_else(|| "cohort".into()),
            rotation: env_string("COHORT_LOG_ROTATION")
                .map(|r| Rotation::parse(&r))
                .unwrap_or(Rotation::Daily),
        })
    }
}

/// Console output on stderr filtered by `RUST_LOG` (default `info`), plus the
/// rolling file when enabled. The file only carries `cohort::*` targets.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(console.with_filter(filter));

    let Some(rolling) = RollingLog::from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&rolling.dir).is_err() {
        tracing::warn!(directory = %rolling.dir.display(), "failed to create log directory");
    }
    let writer = rolling.rotation.appender(&rolling.dir, &rolling.prefix);
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let targets = Targets::new().with_target("cohort", tracing::Level::DEBUG);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(file_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "COHORT_LOG_ROLL",
            "COHORT_LOG_DIR",
            "COHORT_LOG_PREFIX",
            "COHORT_LOG_ROTATION",
            "COHORT_STATE_DIR",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rolling_log_is_opt_in() {
        clear();
        assert_eq!(RollingLog::from_env(), None);
        std::env::set_var("COHORT_LOG_ROLL", "0");
        assert_eq!(RollingLog::from_env(), None);
        clear();
    }

    #[test]
    #[serial]
    fn rolling_log_reads_env() {
        clear();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("COHORT_LOG_ROLL", "1");
        std::env::set_var("COHORT_STATE_DIR", dir.path());
        std::env::set_var("COHORT_LOG_ROTATION", "HOURLY");
        let log = RollingLog::from_env().unwrap();
        assert_eq!(log.dir, dir.path().join("logs"));
        assert_eq!(log.prefix, "cohort");
        assert_eq!(log.rotation, Rotation::Hourly);

        std::env::set_var("COHORT_LOG_DIR", "/var/log/cohort");
        std::env::set_var("COHORT_LOG_PREFIX", "node");
        std::env::set_var("COHORT_LOG_ROTATION", "weekly");
        let log = RollingLog::from_env().unwrap();
        assert_eq!(log.dir, PathBuf::from("/var/log/cohort"));
        assert_eq!(log.prefix, "node");
        assert_eq!(log.rotation, Rotation::Daily);
        clear();
    }
}
