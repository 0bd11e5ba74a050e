use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_PASS: LazyLock<Option<ProgressStyle>> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .ok()
        .map(|style| style.progress_chars("=>-"))
});

static STYLE_TASK: LazyLock<Option<ProgressStyle>> =
    LazyLock::new(|| ProgressStyle::default_spinner().template("{spinner:.blue} {msg}").ok());

/// Short coloured `(+Nms)` suffix for log lines.
pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

pub(crate) fn get_style_pass() -> anyhow::Result<ProgressStyle> {
    STYLE_PASS
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Error setting progress bar template"))
}

pub(crate) fn get_style_task() -> anyhow::Result<ProgressStyle> {
    STYLE_TASK
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Error setting spinner template"))
}

/// Installs a global subscriber that draws progress bars for `pass` and
/// `task` spans and filters through `RUST_LOG` (default `info`).
///
/// Calling it again after a subscriber is installed is a no-op.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init();

    if let Err(e) = result {
        tracing::debug!("logging already initialised: {e}");
    }

    Ok(())
}

#[cfg(not(feature = "logging"))]
pub fn init_logging() -> anyhow::Result<()> {
    Ok(())
}
