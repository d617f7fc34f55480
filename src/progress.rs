use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{error, warn};

/// Template used for every download bar
pub(crate) const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})";

const FALLBACK_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar} {pos}/{len}";

/// A builder that helps in making a new [ProgressStyle] for use.
pub(crate) struct ProgressStyleBuilder {
    /// The [ProgressStyle] being built.
    progress_style: ProgressStyle,
}

impl ProgressStyleBuilder {
    /// Sets the template of the progress style, falling back to a plain bar if it does not parse.
    pub(crate) fn template(mut self, msg_template: &str) -> Self {
        match self.progress_style.clone().template(msg_template) {
            Ok(style) => self.progress_style = style,
            Err(err) => {
                warn!("Template error with '{}': {}. Using fallback template.", msg_template, err);
                self.progress_style = match self.progress_style.clone().template(FALLBACK_TEMPLATE) {
                    Ok(style) => style,
                    Err(e) => {
                        error!("Fallback template also failed: {}. Using default bar.", e);
                        ProgressStyle::default_bar()
                    }
                };
            }
        }
        self
    }

    /// Sets the progress style chars.
    pub(crate) fn progress_chars(mut self, chars: &str) -> Self {
        self.progress_style = self.progress_style.progress_chars(chars);
        self
    }

    pub(crate) fn build(self) -> ProgressStyle {
        self.progress_style
    }
}

impl Default for ProgressStyleBuilder {
    fn default() -> Self {
        Self {
            progress_style: ProgressStyle::default_bar(),
        }
    }
}

/// A builder that helps in initializing and configuring a new [ProgressBar] for use.
pub(crate) struct ProgressBarBuilder {
    /// The [ProgressBar] to build.
    progress_bar: ProgressBar,
}

impl ProgressBarBuilder {
    /// Creates new instance of the builder with `len` total steps.
    pub(crate) fn new(len: u64) -> Self {
        Self {
            progress_bar: ProgressBar::new(len),
        }
    }

    /// Sets the style of the progress bar to the style given.
    pub(crate) fn style(self, progress_style: ProgressStyle) -> Self {
        self.progress_bar.set_style(progress_style);
        self
    }

    /// Sets the draw target (output) of the progress bar to the target given.
    pub(crate) fn draw_target(self, target: ProgressDrawTarget) -> Self {
        self.progress_bar.set_draw_target(target);
        self
    }

    pub(crate) fn message(self, message: impl Into<String>) -> Self {
        self.progress_bar.set_message(message.into());
        self
    }

    /// Sets the steady tick's duration to the given duration.
    pub(crate) fn steady_tick(self, duration: Duration) -> Self {
        self.progress_bar.enable_steady_tick(duration);
        self
    }

    /// Returns the newly built progress bar.
    pub(crate) fn build(self) -> ProgressBar {
        self.progress_bar
    }
}

/// A stderr bar for a run whose length is not known yet
pub(crate) fn download_bar(message: &str) -> ProgressBar {
    let style = ProgressStyleBuilder::default()
        .template(BAR_TEMPLATE)
        .progress_chars("=> ")
        .build();

    ProgressBarBuilder::new(0)
        .style(style)
        .draw_target(ProgressDrawTarget::stderr())
        .message(message)
        .steady_tick(Duration::from_millis(100))
        .build()
}

/// Adapt a bar to the `(processed, total)` progress callback. The total may shrink mid-run.
pub(crate) fn progress_hook(bar: &ProgressBar) -> impl Fn(usize, usize) + Send + Sync + Clone + 'static {
    let bar = bar.clone();
    move |done, total| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
    }
}
