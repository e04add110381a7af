use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn lenspipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lenspipe"))
        .env_remove("LENSPIPE_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run lenspipe")
}

fn png_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
        .count()
}

#[test]
fn filters_lists_builtins() {
    let output = lenspipe(&["filters"]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.lines().any(|line| line == "identity"));
    assert!(stdout.lines().any(|line| line == "watermark"));
}

#[test]
fn check_shader_reports_uniforms_and_rejects_broken_bodies() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("tint.frag");
    fs::write(
        &good,
        "void mainImage(out vec4 color, in vec2 uv) {\n    \
         vec4 source = texture(inputImageTexture, uv);\n    \
         color = vec4(source.rgb * params.intensity, source.a);\n}\n",
    )
    .unwrap();
    let output = lenspipe(&["check-shader", good.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("intensity"));

    let broken = dir.path().join("broken.frag");
    fs::write(
        &broken,
        "void mainImage(out vec4 color, in vec2 uv) { color = nope(uv); }\n",
    )
    .unwrap();
    let output = lenspipe(&["check-shader", broken.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn run_writes_relayed_frames_and_capture() {
    let dir = TempDir::new().unwrap();
    let frames = dir.path().join("frames");
    let capture = dir.path().join("still.png");

    let output = lenspipe(&[
        "run",
        "--backend",
        "recording",
        "--filter",
        "sepia",
        "--size",
        "32x16",
        "--frames",
        "5",
        "--fps",
        "0",
        "--output",
        frames.to_str().unwrap(),
        "--capture",
        capture.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    assert!(capture.exists());
    assert!(png_count(&frames) >= 1);
    let still = image::open(&capture).unwrap();
    assert_eq!((still.width(), still.height()), (32, 16));
}

#[test]
fn run_reads_pipeline_config() {
    let dir = TempDir::new().unwrap();
    let frames = dir.path().join("out");
    let config = dir.path().join("pipeline.toml");
    fs::write(
        &config,
        "version = 1\n\
         \n\
         [preview]\n\
         width = 16\n\
         height = 8\n\
         \n\
         [filter]\n\
         kind = \"invert\"\n\
         \n\
         [run]\n\
         frames = 3\n\
         fps = 60.0\n",
    )
    .unwrap();

    let output = lenspipe(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--backend",
        "recording",
        "--output",
        frames.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(png_count(&frames) >= 1);

    let first = image::open(frames.join("frame-00000.png")).unwrap();
    assert_eq!((first.width(), first.height()), (16, 8));
}

#[test]
fn run_rejects_zero_every() {
    let output = lenspipe(&["run", "--backend", "recording", "--every", "0"]);
    assert!(!output.status.success());
}
