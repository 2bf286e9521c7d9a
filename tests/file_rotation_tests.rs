//! File sink rotation behavior.

use std::sync::Arc;

use eventforge::config::Config;
use eventforge::pipeline::Pipeline;
use eventforge::script::NullScriptHost;

#[test]
fn test_rotation_keeps_bounded_backups() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("rotate.out");

    // Each event serializes to 10 bytes; 40 ticks write 400 bytes against a
    // 100-byte limit with two backups kept.
    let yaml = format!(
        r#"
global:
  output:
    outputter: file
    outputTemplate: raw
    fileName: {}
    maxBytes: 100
    backupFiles: 2
samples:
  - name: rotator
    count: 1
    interval: 1
    endIntervals: 40
    lines:
      - _raw: "123456789"
"#,
        base.display()
    );

    let config = Config::from_yaml(&yaml).unwrap();
    let pipeline = Pipeline::new(config, Arc::new(NullScriptHost)).unwrap();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let summary = runtime.block_on(pipeline.run());
    assert_eq!(summary.events, 40);

    let size_of = |path: &std::path::Path| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let numbered = |n: u32| {
        let mut name = base.as_os_str().to_owned();
        name.push(format!(".{n}"));
        std::path::PathBuf::from(name)
    };

    // The base file never rests above the limit.
    assert!(size_of(&base) <= 100, "base file exceeds maxBytes");
    // Rotated files are the just-filled generations, each over the limit.
    for n in 1..=2 {
        let path = numbered(n);
        assert!(path.exists(), "missing backup .{n}");
        assert!(size_of(&path) > 100, "backup .{n} rotated too early");
    }
    // No backups beyond the configured count.
    assert!(!numbered(3).exists());

    // Three generations survive; the oldest 110-byte generation fell off.
    let mut total = size_of(&base);
    for n in 1..=2 {
        total += size_of(&numbered(n));
    }
    assert_eq!(summary.bytes, 400);
    assert_eq!(total, 290, "base 70 bytes plus two 110-byte backups");
}
