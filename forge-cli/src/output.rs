// Output formatting helpers for the build report
// Progress goes to stderr; stdout carries command output or the JSON report

use std::io::IsTerminal;
use std::sync::OnceLock;

/// ANSI styling only on an interactive stderr, and never with NO_COLOR set
fn color_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal())
}

fn paint(style: &str, text: &str) -> String {
    if color_enabled() {
        format!("\x1b[{}m{}\x1b[0m", style, text)
    } else {
        text.to_string()
    }
}

/// Print a status message: "    Building message"
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint("1;36", &format!("{:>12}", action)), message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("{} {}", paint("1;32", "  \u{2713}"), message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("{} {}", paint("1;31", "  \u{2717}"), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", paint("33", "  !"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint("1;31", "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", paint("36", "  i"), message);
}

/// Print a muted line (notes, reclaimed paths)
pub fn dim(message: &str) {
    eprintln!("{}", paint("2", message));
}

pub fn dim_success(message: &str) {
    eprintln!("{}", paint("32", message));
}

pub fn dim_failure(message: &str) {
    eprintln!("{}", paint("31", message));
}

/// Print a stage header with its position in the run
pub fn stage_header(name: &str, position: usize, total: usize) {
    eprintln!("{} [{}/{}] '{}'", paint("1;34", "  Stage"), position, total, name);
}

/// Command output, indented
pub fn step_output(line: &str) {
    println!("        | {}", line);
}

/// Command error output, indented
pub fn step_error(line: &str) {
    eprintln!("{}", paint("31", &format!("        | {}", line)));
}

pub fn header(message: &str) {
    eprintln!("{}", paint("1", &format!("==> {}", message)));
}
