use anyhow::Result;
use chrono::Utc;
use gemcode_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Run logger: every agent run appends timestamped lines to
/// `.gemcode/agent.log`; verbose mode additionally mirrors progress to stderr.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(sandbox_root: &Path) -> Result<Self> {
        let dir = runtime_dir(sandbox_root);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("agent.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to the run log only.
    pub fn log(&self, msg: &str) {
        let _ = self.append_log_line(&format!("{} {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a message to stderr with `[gemcode]` prefix when verbose mode is on,
    /// and always to the run log.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[gemcode] {msg}");
        }
        self.log(msg);
    }

    /// Log a warning — always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[gemcode WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
