use serde::Serialize;

/// Everything a finished (or killed) worker left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; a signal-terminated child reports `128 + signal`.
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, the text artifact markers are searched in.
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        text.push_str(&self.stdout);
        text.push('\n');
        text.push_str(&self.stderr);
        text
    }
}
