use rust_htslib::bam;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

const HEADER_TEXT: &[u8] = b"@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000000\n";

/// Stub samtools: a valid version banner on a no-argument run; in mpileup
/// mode it drains the FIFO, sleeps longer for earlier chunks so completion
/// order is reversed, and prints one header line plus one body line named
/// after the chunk number.
const STUB_SAMTOOLS: &str = r##"#!/bin/sh
if [ "$#" -eq 0 ]; then
  echo "Program: stub samtools"
  echo ""
  echo "Version: 1.19 (stub)"
  exit 1
fi
fifo="$2"
num=$(basename "$fifo")
cat "$fifo" > /dev/null
delay=$((8 - num))
[ "$delay" -lt 0 ] && delay=0
sleep "0.0$delay"
echo "#HEADER"
echo "body $num"
"##;

fn driver_exe() -> &'static str {
    env!("CARGO_BIN_EXE_sambamba-pileup")
}

fn install_stub_samtools(dir: &Path) {
    let path = dir.join("samtools");
    fs::write(&path, STUB_SAMTOOLS).expect("expected stub write success");
    let mut permissions = fs::metadata(&path)
        .expect("expected stub metadata")
        .permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("expected stub chmod success");
}

fn stubbed_path(stub_dir: &Path) -> String {
    match std::env::var("PATH") {
        Ok(path) => format!("{}:{path}", stub_dir.display()),
        Err(_) => stub_dir.display().to_string(),
    }
}

fn write_synthetic_bam(path: &Path, positions: &[i64]) {
    let view = bam::HeaderView::from_bytes(HEADER_TEXT);
    let header = bam::Header::from_template(&view);
    let mut writer = bam::Writer::from_path(path, &header, bam::Format::Bam)
        .expect("expected BAM writer open success");
    for (index, pos0) in positions.iter().enumerate() {
        let sam = format!(
            "r{index}\t0\tchr1\t{}\t60\t10M\t*\t0\t0\tACGTACGTAC\tFFFFFFFFFF",
            pos0 + 1
        );
        let record =
            bam::Record::from_sam(&view, sam.as_bytes()).expect("expected valid SAM record");
        writer.write(&record).expect("expected record write success");
    }
}

struct RunFixture {
    _dir: tempfile::TempDir,
    bam_path: PathBuf,
    out_path: PathBuf,
    tmp_path: PathBuf,
    path_env: String,
}

fn fixture(positions: &[i64]) -> RunFixture {
    let dir = tempfile::tempdir().expect("expected tempdir");
    let stub_dir = dir.path().join("bin");
    let tmp_path = dir.path().join("tmp");
    fs::create_dir(&stub_dir).expect("expected stub dir");
    fs::create_dir(&tmp_path).expect("expected tmp dir");
    install_stub_samtools(&stub_dir);

    let bam_path = dir.path().join("input.bam");
    write_synthetic_bam(&bam_path, positions);

    RunFixture {
        bam_path,
        out_path: dir.path().join("out.txt"),
        tmp_path,
        path_env: stubbed_path(&stub_dir),
        _dir: dir,
    }
}

fn run_driver(fixture: &RunFixture, extra: &[&str]) -> std::process::Output {
    let mut command = Command::new(driver_exe());
    command
        .arg(&fixture.bam_path)
        .arg("-o")
        .arg(&fixture.out_path)
        .arg("--tmpdir")
        .arg(&fixture.tmp_path)
        .args(extra)
        .env("PATH", &fixture.path_env);
    command.output().expect("expected driver to execute")
}

#[test]
fn chunks_emit_in_dense_order_with_single_header() {
    let positions: Vec<i64> = (0..48).map(|index| index * 50).collect();
    let fixture = fixture(&positions);

    let output = run_driver(&fixture, &["-t", "4", "-b", "600"]);
    assert!(
        output.status.success(),
        "expected run success: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let content = fs::read_to_string(&fixture.out_path).expect("expected output file");
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines.len() > 2, "expected several chunks, got: {content:?}");

    let header_count = lines.iter().filter(|line| **line == "#HEADER").count();
    assert_eq!(header_count, 1, "expected a single header: {content:?}");
    assert_eq!(lines[0], "#HEADER");
    for (index, line) in lines[1..].iter().enumerate() {
        assert_eq!(*line, format!("body {}", index + 1));
    }
}

#[test]
fn single_chunk_output_is_verbatim() {
    let fixture = fixture(&[100, 200, 300]);

    // default buffer size: everything fits into chunk 1, no header strip
    let output = run_driver(&fixture, &["-t", "2"]);
    assert!(
        output.status.success(),
        "expected run success: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let content = fs::read_to_string(&fixture.out_path).expect("expected output file");
    assert_eq!(content, "#HEADER\nbody 1\n");
}

#[test]
fn empty_input_produces_empty_output() {
    let fixture = fixture(&[]);

    let output = run_driver(&fixture, &["-t", "4"]);
    assert!(
        output.status.success(),
        "expected run success: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let content = fs::read(&fixture.out_path).expect("expected output file");
    assert!(content.is_empty(), "expected empty output for empty input");
}

#[test]
fn region_restriction_limits_the_processed_reads() {
    let positions: Vec<i64> = (0..48).map(|index| index * 50).collect();
    let fixture = fixture(&positions);
    rust_htslib::bam::index::build(
        &fixture.bam_path,
        None,
        rust_htslib::bam::index::Type::Bai,
        1,
    )
    .expect("expected index build success");

    let bed_path = fixture.bam_path.with_file_name("regions.bed");
    fs::write(&bed_path, "chr1\t0\t500\n").expect("expected BED write success");

    let full = run_driver(&fixture, &["-b", "600", "--force"]);
    assert!(full.status.success());
    let full_lines = fs::read_to_string(&fixture.out_path)
        .expect("expected output file")
        .lines()
        .count();

    let restricted = run_driver(
        &fixture,
        &[
            "-b",
            "600",
            "--force",
            "-L",
            &bed_path.display().to_string(),
        ],
    );
    assert!(
        restricted.status.success(),
        "expected restricted run success: {}",
        String::from_utf8_lossy(&restricted.stderr)
    );
    let restricted_lines = fs::read_to_string(&fixture.out_path)
        .expect("expected output file")
        .lines()
        .count();

    assert!(restricted_lines >= 2, "expected at least one chunk");
    assert!(
        restricted_lines < full_lines,
        "expected fewer chunks over a restricted region ({restricted_lines} vs {full_lines})"
    );
}

#[test]
fn run_directory_is_removed_after_success() {
    let fixture = fixture(&[100, 200]);

    let output = run_driver(&fixture, &[]);
    assert!(
        output.status.success(),
        "expected run success: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let leftovers: Vec<_> = fs::read_dir(&fixture.tmp_path)
        .expect("expected tmpdir listing")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("sambamba-fork-"))
        .collect();
    assert!(leftovers.is_empty(), "expected run dir cleanup: {leftovers:?}");
}

#[test]
fn failing_external_tool_fails_the_run_and_cleans_up() {
    let fixture = fixture(&[100, 200]);
    // overwrite the stub with one that dies in mpileup mode
    let stub = fixture.path_env.split(':').next().map(PathBuf::from);
    let stub_dir = stub.expect("expected stub dir on PATH");
    fs::write(
        stub_dir.join("samtools"),
        "#!/bin/sh\nif [ \"$#\" -eq 0 ]; then\n  echo stub\n  echo\n  echo \"Version: 1.19\"\n  exit 1\nfi\ncat \"$2\" > /dev/null\necho \"chunk exploded\" >&2\nexit 3\n",
    )
    .expect("expected stub overwrite");

    // -g selects the BCF recipe: one chunk, no strip, no spool compression,
    // so the stub is the whole pipeline and its exit status is the shell's
    let output = run_driver(&fixture, &["-t", "2", "--samtools", "-g"]);
    assert!(!output.status.success(), "expected run failure");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("sambamba-pileup:"),
        "expected prefixed error, got: {stderr}"
    );
    assert!(
        stderr.contains("chunk exploded"),
        "expected captured tool stderr, got: {stderr}"
    );

    let leftovers: Vec<_> = fs::read_dir(&fixture.tmp_path)
        .expect("expected tmpdir listing")
        .filter_map(|entry| entry.ok())
        .collect();
    assert!(leftovers.is_empty(), "expected cleanup on failure");
}
