use anyhow::Context;
use std::path::Path;

use crate::integrity::{CommandOutput, CommandRunner};

pub fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    // create a temporary directory
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt
    let foo_path = tmp_dir.path().join("foo");
    std::fs::create_dir(&foo_path)?;
    std::fs::write(foo_path.join("0.txt"), "0")?;
    let bar_path = foo_path.join("bar");
    std::fs::create_dir(&bar_path)?;
    std::fs::write(bar_path.join("1.txt"), "1")?;
    std::fs::write(bar_path.join("2.txt"), "2")?;
    std::fs::write(bar_path.join("3.txt"), random_bytes(100_000))?;
    let baz_path = foo_path.join("baz");
    std::fs::create_dir(&baz_path)?;
    std::fs::write(baz_path.join("4.txt"), "4")?;
    std::fs::write(baz_path.join("5.txt"), random_bytes(70_001))?;
    Ok(tmp_dir)
}

/// Deterministic pseudo-random content, the same for a given length
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(len as u64);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

pub fn check_dirs_identical(src: &Path, dst: &Path) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let dst_path = dst.join(relative);
        let dst_md = std::fs::metadata(&dst_path)
            .with_context(|| format!("Destination file {dst_path:?} is missing!"))?;
        assert_eq!(entry.file_type().is_dir(), dst_md.is_dir(), "{relative:?}");
        if entry.file_type().is_file() {
            let src_contents = std::fs::read(entry.path())?;
            let dst_contents = std::fs::read(&dst_path)?;
            assert!(src_contents == dst_contents, "{relative:?} differs");
        }
    }
    Ok(())
}

/// Runs commands with the local shell, standing in for the remote host
pub struct LocalShell;

impl CommandRunner for LocalShell {
    fn execute(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .with_context(|| format!("failed running {command:?}"))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

/// Remote side that always reports the same digest
pub struct ForgedDigest;

impl ForgedDigest {
    pub const DIGEST: &'static str = "00000000000000000000000000000000";
}

impl CommandRunner for ForgedDigest {
    fn execute(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let path = command.trim_start_matches("md5sum ");
        Ok(CommandOutput {
            status: 0,
            output: format!("{}  {path}\n", Self::DIGEST),
        })
    }
}

#[test]
fn random_bytes_depend_only_on_length() {
    assert_eq!(random_bytes(4096), random_bytes(4096));
    assert_eq!(random_bytes(0), Vec::<u8>::new());
    let content = random_bytes(100_000);
    assert_eq!(content.len(), 100_000);
    // not a constant fill
    assert!(content.windows(2).any(|pair| pair[0] != pair[1]));
}
