//! Logging re-exports shared by the library and the CLI.
pub use color_eyre::eyre::eyre;
pub use tracing::{debug, error, info, span, trace, warn};

/// Frames from these crates only add noise to a wizard error report.
const FILTERED_FRAMES: &[&str] = &[
    "tokio::",
    "tracing::",
    "color_eyre::",
    "<core::",
    "hyper::",
    "reqwest::",
    "futures_util::",
];

/// Install color_eyre as the global error handler.
#[tracing::instrument]
pub fn install_color_eyre() -> color_eyre::eyre::Result<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .add_default_filters()
        .add_frame_filter(Box::new(|frames| {
            frames.retain(|frame| match frame.name.as_ref() {
                Some(name) => !FILTERED_FRAMES.iter().any(|f| name.starts_with(f)),
                None => true,
            });
        }))
        .install()?;

    Ok(())
}

/// Mask a secret for log output, keeping only its length visible.
pub fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("<redacted:{}>", secret.chars().count())
    }
}
