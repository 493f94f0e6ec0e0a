use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;

struct Fixture {
    tempdir: TempDir,
}

impl Fixture {
    fn setup() -> anyhow::Result<Self> {
        let tempdir = TempDir::new()?;
        tempdir.child("shadow").create_dir_all()?;
        tempdir.child("mnt").create_dir_all()?;

        Ok(Self { tempdir })
    }

    fn command(&self) -> anyhow::Result<Command> {
        let mut cmd = Command::cargo_bin("shadowtrace")?;
        cmd.env_remove("RUST_LOG");

        Ok(cmd)
    }
}

#[test]
fn help_lists_arguments() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;

    fixture
        .command()?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("SHADOW"))
        .stdout(predicate::str::contains("MOUNTPOINT"))
        .stdout(predicate::str::contains("RUST_LOG_FORMAT"));

    Ok(())
}

#[test]
fn missing_arguments() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;

    fixture.command()?.assert().failure();

    Ok(())
}

#[test]
fn missing_shadow_directory() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;

    fixture
        .command()?
        .arg(fixture.tempdir.child("doesnotexist").path())
        .arg(fixture.tempdir.child("mnt").path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ERROR:"))
        .stderr(predicate::str::contains("does not exist"));

    Ok(())
}

#[test]
fn mountpoint_is_a_file() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;
    let file = fixture.tempdir.child("file");
    file.write_str("hello")?;

    fixture
        .command()?
        .arg(fixture.tempdir.child("shadow").path())
        .arg(file.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("is not a directory"));

    Ok(())
}

#[test]
fn refuse_shadow_inside_mountpoint() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;
    let inner = fixture.tempdir.child("mnt/inner");
    inner.create_dir_all()?;

    fixture
        .command()?
        .arg(inner.path())
        .arg(fixture.tempdir.child("mnt").path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("inside mountpoint"));

    Ok(())
}

#[test]
fn refuse_bad_config() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;
    let config = fixture.tempdir.child("config.toml");
    config.write_str("[cache]\nattr_valid = \"whenever\"\n")?;

    fixture
        .command()?
        .arg("--config")
        .arg(config.path())
        .arg(fixture.tempdir.child("shadow").path())
        .arg(fixture.tempdir.child("mnt").path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to read TOML config file"));

    Ok(())
}

#[test]
fn refuse_missing_config() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;

    fixture
        .command()?
        .arg("--config")
        .arg(fixture.tempdir.child("missing.toml").path())
        .arg(fixture.tempdir.child("shadow").path())
        .arg(fixture.tempdir.child("mnt").path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ERROR:"));

    Ok(())
}

#[test]
fn refuse_unknown_trace_format() -> anyhow::Result<()> {
    let fixture = Fixture::setup()?;

    fixture
        .command()?
        .arg("--trace-format")
        .arg("xml")
        .arg(fixture.tempdir.child("shadow").path())
        .arg(fixture.tempdir.child("mnt").path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown trace format"));

    Ok(())
}
