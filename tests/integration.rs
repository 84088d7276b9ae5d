//! End-to-end tests that exercise the compiled `harvester` binary against
//! temp-dir repositories of real archives and images, using the built-in
//! walk processor and save-to-disk export.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

fn harvester_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvester");
    path
}

fn make_archive(dir: &Path, name: &str, files: &[(&str, &[u8])]) {
    let gz = GzEncoder::new(
        File::create(dir.join(name)).unwrap(),
        Compression::default(),
    );
    let mut builder = tar::Builder::new(gz);
    for (entry_name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, entry_name, *contents)
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn make_deb(dir: &Path, name: &str, files: &[(&str, &[u8])]) {
    let mut tar_builder = tar::Builder::new(Vec::new());
    for (entry_name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder
            .append_data(&mut header, entry_name, *contents)
            .unwrap();
    }
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar_builder.into_inner().unwrap()).unwrap();
    let data = gz.finish().unwrap();

    let mut builder = ar::Builder::new(File::create(dir.join(name)).unwrap());
    builder
        .append(
            &ar::Header::new(b"debian-binary".to_vec(), 4),
            &b"2.0\n"[..],
        )
        .unwrap();
    builder
        .append(
            &ar::Header::new(b"data.tar.gz".to_vec(), data.len() as u64),
            data.as_slice(),
        )
        .unwrap();
}

struct TestEnv {
    _tmp: TempDir,
    config_path: PathBuf,
    export_path: PathBuf,
    temp_root: PathBuf,
}

fn setup_test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    // tar.gz repository: two archives sharing one file
    // ("common/notes.txt") so repository dedup is observable end to end.
    let targz_dir = root.join("repo");
    fs::create_dir_all(&targz_dir).unwrap();
    make_archive(
        &targz_dir,
        "alpha.tar.gz",
        &[
            ("bin/alpha", b"alpha binary".as_slice()),
            ("common/notes.txt", b"shared notes".as_slice()),
        ],
    );
    make_archive(
        &targz_dir,
        "beta.tar.gz",
        &[
            ("bin/beta", b"beta binary".as_slice()),
            ("common/notes.txt", b"shared notes".as_slice()),
        ],
    );

    // deb repository: one package, unpacked natively.
    let deb_dir = root.join("debs");
    fs::create_dir_all(&deb_dir).unwrap();
    make_deb(
        &deb_dir,
        "hello.deb",
        &[
            ("usr/bin/hello", b"hello binary".as_slice()),
            ("etc/hello.conf", b"hello config".as_slice()),
        ],
    );

    // iso repository: the extraction tool is stubbed with `sh` so the
    // test does not depend on bsdtar being installed.
    let iso_dir = root.join("isos");
    fs::create_dir_all(&iso_dir).unwrap();
    fs::write(iso_dir.join("mini.iso"), b"iso image bytes").unwrap();

    let config_path = root.join("harvester.toml");
    let export_path = root.join("uploads");
    let temp_root = root.join("scratch");
    let config_content = format!(
        r#"[engine]
worker_count = 2
cache_dir = "{root}/cache"
temp_root = "{root}/scratch"
export = false
export_path = "{root}/uploads"

[jobstore]
path = "{root}/data/jobs.sqlite"

[importers.targz]
root = "{root}/repo"

[importers.deb]
root = "{root}/debs"

[importers.iso]
root = "{root}/isos"
extract_command = ["sh", "-c", "cp {{input}} {{output}}/root.bin"]
"#,
        root = root.display()
    );
    fs::write(&config_path, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        config_path,
        export_path,
        temp_root,
    }
}

fn harvester(env: &TestEnv, args: &[&str]) -> std::process::Output {
    Command::new(harvester_binary())
        .arg("--config")
        .arg(&env.config_path)
        .args(args)
        .output()
        .expect("failed to spawn harvester binary")
}

fn read_manifest(dir: &Path) -> Vec<serde_json::Value> {
    serde_json::from_slice(&fs::read(dir.join("samples.json")).unwrap()).unwrap()
}

#[test]
fn full_run_save_to_disk() {
    let env = setup_test_env();

    let init = harvester(&env, &["init"]);
    assert!(init.status.success(), "init failed: {init:?}");

    let run = harvester(&env, &["run"]);
    assert!(run.status.success(), "run failed: {run:?}");

    // One export directory per source: <repo>___<source_id>___<sha256>.
    let mut export_dirs: Vec<PathBuf> = fs::read_dir(&env.export_path)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    export_dirs.sort();
    assert_eq!(export_dirs.len(), 4, "one export dir per source");
    for dir in &export_dirs {
        assert!(dir.join("samples.json").exists());
    }

    let dir_name = |dir: &PathBuf| dir.file_name().unwrap().to_string_lossy().into_owned();

    // tar.gz repository: each source carries two samples; the shared file
    // uploads only once across the repository.
    let targz_dirs: Vec<&PathBuf> = export_dirs
        .iter()
        .filter(|dir| dir_name(dir).starts_with("targz___"))
        .collect();
    assert_eq!(targz_dirs.len(), 2);
    let mut uploads = 0;
    let mut total = 0;
    for dir in &targz_dirs {
        let manifest = read_manifest(dir);
        total += manifest.len();
        uploads += manifest
            .iter()
            .filter(|sample| sample["upload"].as_bool().unwrap())
            .count();
    }
    assert_eq!(total, 4);
    assert_eq!(uploads, 3, "three distinct digests across both archives");

    // deb repository: the data.tar members unpack natively.
    let deb_dir = export_dirs
        .iter()
        .find(|dir| dir_name(dir).starts_with("deb___hello.deb___"))
        .expect("deb export dir");
    let deb_manifest = read_manifest(deb_dir);
    assert_eq!(deb_manifest.len(), 2);
    assert!(deb_manifest
        .iter()
        .all(|sample| sample["upload"].as_bool().unwrap()));

    // iso repository: the stub tool produced a single extracted file.
    let iso_dir = export_dirs
        .iter()
        .find(|dir| dir_name(dir).starts_with("iso9660___mini.iso___"))
        .expect("iso export dir");
    let iso_manifest = read_manifest(iso_dir);
    assert_eq!(iso_manifest.len(), 1);
    assert!(iso_manifest[0]["upload"].as_bool().unwrap());

    // Scratch space is purged after every source reaches a terminal state.
    let leftovers: Vec<_> = fs::read_dir(&env.temp_root).unwrap().collect();
    assert!(leftovers.is_empty(), "temp dirs not cleaned: {leftovers:?}");

    // Job store shows every source exported.
    let jobs = harvester(&env, &["jobs"]);
    assert!(jobs.status.success());
    let stdout = String::from_utf8_lossy(&jobs.stdout);
    assert_eq!(stdout.matches("exported").count(), 4, "jobs output: {stdout}");
    assert!(stdout.contains("alpha.tar.gz"));
    assert!(stdout.contains("hello.deb"));
    assert!(stdout.contains("mini.iso"));
}

#[test]
fn second_run_skips_processed_sources() {
    let env = setup_test_env();

    assert!(harvester(&env, &["init"]).status.success());
    assert!(harvester(&env, &["run"]).status.success());

    let dirs_before: Vec<PathBuf> = fs::read_dir(&env.export_path)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();

    // Nothing changed in the repositories, so the second run dispatches
    // no workers and produces no new output.
    assert!(harvester(&env, &["run"]).status.success());
    let dirs_after: Vec<PathBuf> = fs::read_dir(&env.export_path)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(dirs_before.len(), dirs_after.len());

    let jobs = harvester(&env, &["jobs"]);
    let stdout = String::from_utf8_lossy(&jobs.stdout);
    assert!(stdout.contains("4 job(s)"), "jobs output: {stdout}");
}

#[test]
fn failed_jobs_are_queryable() {
    let env = setup_test_env();

    // A file with the right suffix that is not a valid gzip stream fails
    // in preprocess; the run must still succeed.
    let repo = env.config_path.parent().unwrap().join("repo");
    fs::write(repo.join("corrupt.tar.gz"), b"this is not gzip").unwrap();

    assert!(harvester(&env, &["init"]).status.success());
    let run = harvester(&env, &["run"]);
    assert!(run.status.success(), "run must succeed despite a bad source");

    let jobs = harvester(&env, &["jobs", "--failed"]);
    let stdout = String::from_utf8_lossy(&jobs.stdout);
    assert!(stdout.contains("corrupt.tar.gz"), "jobs output: {stdout}");
    assert!(stdout.contains("failed"));
    assert!(!stdout.contains("alpha.tar.gz"));
}
