// src/sys/launcher.rs

use std::process::Stdio;
use tokio::process::Command;

use crate::sys::traits::{LaunchSpec, ServerLauncher};

const EXTRA_PATH: &str = "/usr/local/bin";

/// Runs `frankenphp php-server` for each managed site.
///
/// Arguments are handed to execve one by one; nothing goes through a shell,
/// so a document root with spaces or quotes cannot change the command.
pub struct FrankenPhpLauncher {
    binary: String,
    run_as: Option<String>,
}

impl FrankenPhpLauncher {
    pub fn new(binary: String, run_as: Option<String>) -> Self {
        Self { binary, run_as }
    }

    fn args(&self, spec: &LaunchSpec) -> Vec<String> {
        vec![
            "php-server".to_string(),
            "--listen".to_string(),
            spec.listen_addr(),
            "-r".to_string(),
            spec.document_root.clone(),
        ]
    }
}

impl ServerLauncher for FrankenPhpLauncher {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let path = match std::env::var("PATH") {
            Ok(current) if !current.is_empty() => format!("{EXTRA_PATH}:{current}"),
            _ => EXTRA_PATH.to_string(),
        };

        let mut cmd = match &self.run_as {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-u", user.as_str(), "--", self.binary.as_str()]);
                cmd
            }
            None => Command::new(&self.binary),
        };
        cmd.args(self.args(spec))
            .env("PATH", path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}
