//! MetaTrader 5 terminal integration
//!
//! The terminal and its compiler are black-box subprocesses. The stage
//! runner only talks to them through [`TesterTerminal`], so tests can swap in
//! a scripted fake.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use sysinfo::System;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedPaths;
use crate::error::PipelineError;

/// Operations the pipeline needs from the external strategy tester
#[cfg_attr(test, mockall::automock)]
pub trait TesterTerminal {
    /// Terminal executable, used in diagnostics
    fn executable(&self) -> PathBuf;

    /// Whether an instance is already running against this installation
    fn is_running(&self) -> bool;

    /// Run one test described by an INI file; blocks until the terminal exits
    fn run(&self, config: &Path) -> Result<(), PipelineError>;

    /// Compile an expert source; `Ok(true)` when the binary was produced
    fn compile(&self, source: &Path) -> Result<bool, PipelineError>;

    /// Directory the terminal writes `<report>.xml` into
    fn report_dir(&self) -> PathBuf;

    /// Delete cached optimisation results; returns the number of files removed
    fn clear_test_cache(&self) -> Result<usize, PipelineError>;
}

/// Fail fast when the terminal is already in use
pub fn ensure_idle<T: TesterTerminal + ?Sized>(terminal: &T) -> Result<(), PipelineError> {
    if terminal.is_running() {
        error!(exe = %terminal.executable().display(), "Terminal already running");
        return Err(PipelineError::TerminalBusy(terminal.executable()));
    }
    Ok(())
}

/// Real terminal installation
#[derive(Debug, Clone)]
pub struct Mt5Terminal {
    exe: PathBuf,
    meta_editor: PathBuf,
    data_dir: PathBuf,
    mql5_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Mt5Terminal {
    pub fn new(paths: &ResolvedPaths) -> Self {
        Self {
            exe: paths.terminal_exe.clone(),
            meta_editor: paths.meta_editor_exe.clone(),
            data_dir: paths.terminal_data_dir.clone(),
            mql5_dir: paths.mql5_dir.clone(),
            cache_dir: paths.test_cache_dir.clone(),
        }
    }
}

impl TesterTerminal for Mt5Terminal {
    fn executable(&self) -> PathBuf {
        self.exe.clone()
    }

    fn is_running(&self) -> bool {
        let mut system = System::new();
        system.refresh_processes();

        let exe_name = self
            .exe
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase());

        system.processes().values().any(|process| match process.exe() {
            Some(path) => path == self.exe.as_path(),
            // No exe path visible (permissions); fall back to the process name
            None => exe_name
                .as_deref()
                .is_some_and(|name| process.name().to_lowercase() == name),
        })
    }

    fn run(&self, config: &Path) -> Result<(), PipelineError> {
        info!(config = %config.display(), "Starting terminal");
        let started = Instant::now();

        let status = Command::new(&self.exe)
            .arg(format!("/config:{}", config.display()))
            .status()?;

        let elapsed = started.elapsed().as_secs_f64();
        if !status.success() {
            error!(
                config = %config.display(),
                code = ?status.code(),
                elapsed_secs = elapsed,
                "Terminal exited with failure"
            );
            return Err(PipelineError::TerminalFailed {
                config: config.to_path_buf(),
                code: status.code(),
            });
        }

        info!(config = %config.display(), elapsed_secs = elapsed, "Terminal finished");
        Ok(())
    }

    fn compile(&self, source: &Path) -> Result<bool, PipelineError> {
        if !source.exists() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source not found: {}", source.display()),
            )));
        }

        let binary = source.with_extension("ex5");
        if binary.exists() {
            fs::remove_file(&binary)?;
            debug!(binary = %binary.display(), "Deleted old compiled file");
        }

        // MetaEditor resolves the source relative to the MQL5 directory
        let target = match source.strip_prefix(&self.mql5_dir) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => {
                warn!(
                    source = %source.display(),
                    mql5 = %self.mql5_dir.display(),
                    "Source is outside the MQL5 directory; compiling by absolute path"
                );
                source.display().to_string()
            }
        };

        info!(source = %target, "Compiling");
        let output = Command::new(&self.meta_editor)
            .arg(format!("/compile:{}", target))
            .arg("/log")
            .current_dir(&self.mql5_dir)
            .output()?;

        if binary.exists() {
            info!(binary = %binary.display(), "Compilation succeeded");
            Ok(true)
        } else {
            error!(source = %source.display(), "Compilation failed");
            debug!(
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Compiler output"
            );
            Ok(false)
        }
    }

    fn report_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn clear_test_cache(&self) -> Result<usize, PipelineError> {
        clear_dir_files(&self.cache_dir)
    }
}

/// Delete every file directly inside `dir`; a missing directory is empty
pub fn clear_dir_files(dir: &Path) -> Result<usize, PipelineError> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "Test cache directory does not exist");
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    info!(dir = %dir.display(), removed, "Cleared test cache");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path) -> ResolvedPaths {
        ResolvedPaths {
            terminal_exe: root.join("terminal64.exe"),
            meta_editor_exe: root.join("MetaEditor64.exe"),
            terminal_data_dir: root.to_path_buf(),
            mql5_dir: root.join("MQL5"),
            experts_dir: root.join("MQL5").join("Experts"),
            test_cache_dir: root.join("Tester").join("cache"),
            indicator_dir: root.join("indicators"),
            output_dir: root.join("output"),
            template_dir: root.join("templates"),
        }
    }

    #[test]
    fn test_ensure_idle_rejects_running_terminal() {
        let mut terminal = MockTesterTerminal::new();
        terminal.expect_is_running().return_const(true);
        terminal
            .expect_executable()
            .returning(|| PathBuf::from("terminal64.exe"));

        let err = ensure_idle(&terminal).unwrap_err();
        assert!(matches!(err, PipelineError::TerminalBusy(_)));
        assert!(err.aborts_stage());
    }

    #[test]
    fn test_ensure_idle_passes_when_free() {
        let mut terminal = MockTesterTerminal::new();
        terminal.expect_is_running().return_const(false);
        assert!(ensure_idle(&terminal).is_ok());
    }

    #[test]
    fn test_clear_test_cache() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = Mt5Terminal::new(&paths(dir.path()));
        assert_eq!(terminal.clear_test_cache().unwrap(), 0);

        let cache = dir.path().join("Tester").join("cache");
        fs::create_dir_all(cache.join("nested")).unwrap();
        fs::write(cache.join("a.opt"), "x").unwrap();
        fs::write(cache.join("b.opt"), "x").unwrap();

        assert_eq!(terminal.clear_test_cache().unwrap(), 2);
        assert!(cache.join("nested").exists());
        assert!(!cache.join("a.opt").exists());
    }

    #[test]
    fn test_missing_executables_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = Mt5Terminal::new(&paths(dir.path()));
        assert!(!terminal.is_running());
        assert!(terminal.run(&dir.path().join("ADX_IS.ini")).is_err());
        assert!(terminal.compile(&dir.path().join("missing.mq5")).is_err());
        assert_eq!(terminal.report_dir(), dir.path());
    }
}
