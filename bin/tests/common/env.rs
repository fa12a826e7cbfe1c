use std::{
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Result, bail};

/// a running `fipd` with its health api on `api`
#[derive(Debug)]
pub struct FipdEnv {
    daemon: Child,
    pub api: String,
}

impl FipdEnv {
    /// start `fipd` with `tests/test_configs/<config>`
    pub fn start(config: &str, api_port: u16) -> Self {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/test_configs")
            .join(config);
        let api = format!("127.0.0.1:{api_port}");
        let daemon = Command::new(env!("CARGO_BIN_EXE_fipd"))
            .env("FIPD_LOG", "debug")
            .arg(format!("--config-path={}", path.display()))
            .arg(format!("--external-api={api}"))
            .arg("--threads=2")
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to start fipd");
        Self {
            daemon,
            api: format!("http://{api}"),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api)
    }

    /// poll `/health` until it answers 200
    pub async fn wait_healthy(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(resp) = reqwest::get(self.url("/health")).await
                && resp.status().is_success()
            {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!("fipd not healthy after {timeout:?}")
    }
}

impl Drop for FipdEnv {
    fn drop(&mut self) {
        if let Err(err) = self.daemon.kill() {
            eprintln!("failed to stop fipd: {err}");
        }
        let _ = self.daemon.wait();
    }
}
