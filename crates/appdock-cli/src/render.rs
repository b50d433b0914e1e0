use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use appdock_installer::SwapReport;
use appdock_upgrade::{AppStatus, BlockingError, InstalledAppHandle, UpgradeOutcome};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

pub fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
}

/// One spinner per app while a session is restored.
pub struct SessionProgress {
    style: OutputStyle,
    multi: Option<MultiProgress>,
    started_at: Instant,
}

pub struct AppSpinner {
    bar: Option<ProgressBar>,
}

impl TerminalRenderer {
    pub fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, status: &str, message: &str) {
        let line = render_status_line(self.style, status, message);
        match (self.style, status_badge(status)) {
            (OutputStyle::Rich, Some(badge)) => {
                let rest = line.strip_prefix(badge).unwrap_or(&line);
                println!("{}{rest}", colorize(badge_style(status), badge));
            }
            _ => println!("{line}"),
        }
    }

    pub fn print_section(self, title: &str) {
        if self.style == OutputStyle::Rich {
            println!();
            println!("{}", colorize(section_style(), &format!("== {title} ==")));
        }
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub fn start_session(self) -> SessionProgress {
        SessionProgress {
            style: self.style,
            multi: (self.style == OutputStyle::Rich).then(MultiProgress::new),
            started_at: Instant::now(),
        }
    }
}

impl SessionProgress {
    pub fn spinner(&self, name: &str) -> AppSpinner {
        let bar = self.multi.as_ref().map(|multi| {
            let bar = multi.add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
                bar.set_style(style.tick_chars("|/-\\ "));
            }
            bar.set_message(name.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        AppSpinner { bar }
    }

    pub fn elapsed_suffix(&self) -> String {
        match self.style {
            OutputStyle::Plain => String::new(),
            OutputStyle::Rich => format!(" in {}", format_elapsed(self.started_at.elapsed())),
        }
    }
}

impl AppSpinner {
    pub fn finish(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match (style, status_badge(status)) {
        (OutputStyle::Rich, Some(badge)) => format!("{badge} {message}"),
        _ => message.to_string(),
    }
}

fn status_badge(status: &str) -> Option<&'static str> {
    match status {
        "ok" => Some("[OK]"),
        "step" => Some("[..]"),
        "warn" => Some("[WARN]"),
        "error" => Some("[ERR]"),
        _ => None,
    }
}

pub fn format_handle(handle: &InstalledAppHandle) -> String {
    let mut line = format!(
        "{} {} at {}",
        handle.name,
        handle.version,
        handle.path.display()
    );
    if let Some(pending) = &handle.pending {
        line.push_str(&format!(" ({pending} staged for next launch)"));
    }
    line
}

pub fn format_load_failure(name: &str, err: &BlockingError) -> String {
    format!("{name}: {}", error_chain(err))
}

/// Maps an upgrade result to a status kind and message.
pub fn format_outcome(
    name: &str,
    result: &Result<UpgradeOutcome, BlockingError>,
) -> (&'static str, String) {
    match result {
        Ok(UpgradeOutcome::UpToDate { version }) => ("step", format!("{name}: up-to-date ({version})")),
        Ok(UpgradeOutcome::Promoted {
            previous: Some(previous),
            version,
        }) => ("ok", format!("{name}: upgraded {previous} -> {version}")),
        Ok(UpgradeOutcome::Promoted {
            previous: None,
            version,
        }) => ("ok", format!("{name}: installed {version}")),
        Ok(UpgradeOutcome::Staged { installed, version })
        | Ok(UpgradeOutcome::AlreadyStaged { installed, version }) => (
            "ok",
            format!("{name}: {version} staged, {installed} stays live until shutdown"),
        ),
        Ok(UpgradeOutcome::ManifestUnavailable { installed }) => (
            "warn",
            format!("{name}: manifest unavailable, keeping {installed}"),
        ),
        Ok(UpgradeOutcome::Abandoned {
            installed,
            target,
            reason,
        }) => (
            "warn",
            format!("{name}: upgrade to {target} abandoned, keeping {installed} ({reason})"),
        ),
        Err(err) => ("error", format_load_failure(name, err)),
    }
}

pub fn format_status_lines(statuses: &[AppStatus], style: OutputStyle) -> Vec<String> {
    if statuses.is_empty() {
        return vec!["no apps installed".to_string()];
    }

    let width = statuses
        .iter()
        .map(|status| status.name.len())
        .max()
        .unwrap_or(0);
    statuses
        .iter()
        .map(|status| {
            let marker = if status.current { "*" } else { " " };
            let installed = status
                .installed
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string);
            let available = status
                .available
                .as_ref()
                .map_or_else(|| "?".to_string(), ToString::to_string);
            let mut line = format!(
                "{marker} {:<width$}  installed={installed} available={available} loaded={}",
                status.name, status.loaded
            );
            if let Some(pending) = &status.pending {
                line.push_str(&format!(" staged={pending}"));
            }
            match style {
                OutputStyle::Rich if status.current => colorize(current_style(), &line),
                _ => line,
            }
        })
        .collect()
}

pub fn format_swap_report(report: &SwapReport) -> Vec<(&'static str, String)> {
    let mut lines = Vec::new();
    for swap in &report.applied {
        lines.push(("ok", format!("{}: switched to {}", swap.name, swap.staged_version)));
    }
    for swap in &report.missing {
        lines.push((
            "warn",
            format!("{}: staged {} disappeared before swap", swap.name, swap.staged_version),
        ));
    }
    for (swap, err) in &report.failed {
        lines.push((
            "error",
            format!(
                "{}: swap to {} failed, retrying next launch ({err})",
                swap.name, swap.staged_version
            ),
        ));
    }
    lines
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn badge_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "error" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightBlue,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn current_style() -> Style {
    Style::new().effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
