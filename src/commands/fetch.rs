//! Read one file from the sandbox root.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::provision::Provisioner;

pub(crate) async fn run(path: String, output: Option<PathBuf>) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd)?;

    let provisioner = Provisioner::from_config(&config, &cwd)?;
    let mut session = provisioner.ensure(&config.sandbox.handle()).await?;

    let content = session
        .client
        .read_file(&path)
        .await
        .with_context(|| format!("Failed to read {path} from sandbox"))?;

    write_output(&content, output.as_deref())
}

fn write_output(content: &[u8], output: Option<&Path>) -> Result<()> {
    match output {
        Some(out) => std::fs::write(out, content)
            .with_context(|| format!("Failed to write {}", out.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(content)
                .and_then(|()| stdout.flush())
                .context("Failed to write to stdout")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_output_to_file() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("report.xml");
        write_output(b"<ok/>", Some(&out)).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"<ok/>");
    }
}
