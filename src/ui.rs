use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Start a probe step; the returned guard reports its result.
    pub fn step(&self, name: &str) -> StepGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StepGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StepGuard::new(name.to_string(), None)
        }
    }
}

pub struct StepGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    reported: bool,
}

impl StepGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            reported: false,
        }
    }

    pub fn ok(mut self, detail: &str) {
        self.report('✔', detail);
    }

    pub fn fail(mut self, detail: &str) {
        self.report('✘', detail);
    }

    fn report(&mut self, mark: char, detail: &str) {
        self.reported = true;
        let message = format!(
            "{} {} ({}) {}",
            mark,
            self.name,
            format_duration(self.start.elapsed()),
            detail
        );
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        if !self.reported {
            self.report('?', "abandoned");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
