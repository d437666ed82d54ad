//! The command-line wrapper, exercised through the built binary.

use std::fs;
use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_abcxml"))
}

const AIR: &str = "X:1\nT:Air\nM:4/4\nL:1/4\nK:G\nGABc|d4|]\n";

#[test]
fn converts_abc_file_into_outdir() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("air.abc");
    fs::write(&input, AIR).unwrap();
    let out = dir.path().join("out");

    let status = bin().arg(&input).arg("-o").arg(&out).status().unwrap();
    assert!(status.success());
    let xml = fs::read_to_string(out.join("air.xml")).unwrap();
    assert!(xml.contains("<score-partwise"));
    assert!(xml.contains("<movement-title>Air</movement-title>"));
}

#[test]
fn converts_xml_back_to_abc() {
    let dir = tempfile::tempdir().unwrap();
    let conv = abcxml::abc_to_musicxml(AIR, &abcxml::Options::default()).unwrap();
    let input = dir.path().join("air.musicxml");
    fs::write(&input, conv.output).unwrap();

    let status = bin().arg(&input).arg("-o").arg(dir.path()).status().unwrap();
    assert!(status.success());
    let abc = fs::read_to_string(dir.path().join("air.abc")).unwrap();
    assert!(abc.starts_with("X:1\n"), "got: {}", abc);
    assert!(abc.contains("T:Air"));
}

#[test]
fn tune_selection_writes_numbered_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("two.abc");
    fs::write(
        &input,
        "X:1\nT:First\nK:C\nC4|]\n\nX:2\nT:Second\nK:D\nD4|]\n",
    )
    .unwrap();

    let status = bin()
        .arg(&input)
        .args(["-m", "0,2"])
        .arg("-o")
        .arg(dir.path())
        .status()
        .unwrap();
    assert!(status.success());
    let first = fs::read_to_string(dir.path().join("two01.xml")).unwrap();
    let second = fs::read_to_string(dir.path().join("two02.xml")).unwrap();
    assert!(first.contains("First"));
    assert!(second.contains("Second"));
}

#[test]
fn failed_file_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad.abc");
    fs::write(&bad, "X:1\nK:C\n[CE\n").unwrap();
    let good = dir.path().join("good.abc");
    fs::write(&good, AIR).unwrap();
    let out = dir.path().join("out");

    let status = bin().arg(&bad).arg(&good).arg("-o").arg(&out).status().unwrap();
    assert!(!status.success());
    // The good file still converted
    assert!(out.join("good.xml").exists());
    assert!(!out.join("bad.xml").exists());
}

#[test]
fn wrap_budget_flags_reach_the_renderer() {
    let dir = tempfile::tempdir().unwrap();
    let conv = abcxml::abc_to_musicxml(
        "X:1\nM:4/4\nL:1/4\nK:C\nCDEF|GABc|cBAG|FEDC|]\n",
        &abcxml::Options::default(),
    )
    .unwrap();
    let input = dir.path().join("four.xml");
    fs::write(&input, conv.output).unwrap();

    let status = bin()
        .arg(&input)
        .args(["-b", "1"])
        .arg("-o")
        .arg(dir.path())
        .status()
        .unwrap();
    assert!(status.success());
    let abc = fs::read_to_string(dir.path().join("four.abc")).unwrap();
    let body_lines = abc.lines().filter(|l| l.contains('|')).count();
    assert_eq!(body_lines, 4, "got: {}", abc);
}
