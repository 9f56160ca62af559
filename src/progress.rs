//! Progress bars for CLI download runs.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use resumable_downloader::DownloadInfo;

/// One bar per URL inside a shared [`MultiProgress`].
pub(crate) struct ProgressBoard {
    multi: MultiProgress,
}

impl ProgressBoard {
    pub(crate) fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
        }
    }

    /// Adds a bar labelled with `url` and returns an observer driving it.
    pub(crate) fn track(&self, url: &str) -> impl Fn(&DownloadInfo) + Send + Sync + 'static {
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:40} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.set_message(short_name(url));
        move |info: &DownloadInfo| render(&bar, info)
    }
}

fn render(bar: &ProgressBar, info: &DownloadInfo) {
    match info {
        DownloadInfo::Initialized { .. } => bar.reset(),
        DownloadInfo::Progress(progress) => {
            bar.set_length(progress.total);
            bar.set_position(progress.current);
        }
        DownloadInfo::Cancelling { url } => bar.set_message(format!("{} (cancelling)", short_name(url))),
        DownloadInfo::Success { url, .. } => bar.finish_with_message(format!("{} done", short_name(url))),
        DownloadInfo::Error { url, error } => {
            bar.abandon_with_message(format!("{} failed: {error}", short_name(url)));
        }
    }
}

/// Last path segment of `url`, or the URL itself.
fn short_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| url.to_string())
}
