//! End-to-end pipeline scenarios, captured through the in-memory buffer sink.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, TimeZone};

use eventforge::config::Config;
use eventforge::pipeline::Pipeline;
use eventforge::script::NullScriptHost;

fn run_config(yaml: &str) -> (Vec<String>, eventforge::pipeline::PipelineSummary) {
    let config = Config::from_yaml(yaml).unwrap();
    let pipeline = Pipeline::new(config, Arc::new(NullScriptHost)).unwrap();
    let buffers = pipeline.buffers();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let summary = runtime.block_on(pipeline.run());

    let buffers = buffers.lock().unwrap();
    let output = buffers
        .values()
        .next()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    let lines = output
        .lines()
        .map(str::to_string)
        .collect();
    (lines, summary)
}

#[test]
fn test_static_token_single_event() {
    let (lines, summary) = run_config(
        r#"
global:
  output:
    outputter: buf
    outputTemplate: raw
samples:
  - name: statics
    count: 1
    interval: 1
    endIntervals: 1
    tokens:
      - name: what
        type: static
        replacement: foo
    lines:
      - _raw: $what$
"#,
    );
    assert_eq!(lines, vec!["foo".to_string()]);
    assert_eq!(summary.events, 1);
}

#[test]
fn test_json_output_fields_and_timestamps() {
    let (lines, _) = run_config(
        r#"
global:
  output:
    outputter: buf
    outputTemplate: json
samples:
  - name: jsonsample
    begin: 2001-10-20 00:00:00
    end: 2001-10-20 00:00:01
    interval: 1
    count: 1
    tokens:
      - name: ts
        type: timestamp
        replacement: "%d/%b/%Y %H:%M:%S:%L"
      - name: epochts
        type: timestamp
        field: _time
        replacement: "%s.%L"
    lines:
      - sourcetype: jsontest
        source: eventforge
        host: forge
        index: main
        _time: $epochts$
        _raw: $ts$
        field1: value1
        field2: value2
"#,
    );
    assert_eq!(lines.len(), 1, "expected exactly one event");

    let event: HashMap<String, String> = serde_json::from_str(&lines[0]).unwrap();
    for field in [
        "sourcetype", "source", "host", "index", "_time", "_raw", "field1", "field2",
    ] {
        assert!(event.contains_key(field), "missing field {field}");
    }
    assert_eq!(event["sourcetype"], "jsontest");
    assert_eq!(event["host"], "forge");
    assert_eq!(event["field2"], "value2");

    let expected_epoch = Local
        .with_ymd_and_hms(2001, 10, 20, 0, 0, 0)
        .unwrap()
        .timestamp();
    assert_eq!(event["_time"], format!("{expected_epoch}.000"));
    assert_eq!(event["_raw"], "20/Oct/2001 00:00:00:000");
}

#[test]
fn test_cache_cohorts_repeat_first_interval() {
    let (lines, summary) = run_config(
        r#"
global:
  cacheIntervals: 2
  output:
    outputter: buf
    outputTemplate: raw
samples:
  - name: cachesample
    begin: 2001-10-20 12:00:00
    end: 2001-10-20 12:00:04
    interval: 1
    count: 1
    tokens:
      - name: ts1
        type: timestamp
        replacement: "%Y-%m-%dT%H:%M:%S"
    lines:
      - _raw: $ts1$
"#,
    );
    // SET, USE, USE replay the first instant; the fourth tick seeds afresh.
    assert_eq!(
        lines,
        vec![
            "2001-10-20T12:00:00".to_string(),
            "2001-10-20T12:00:00".to_string(),
            "2001-10-20T12:00:00".to_string(),
            "2001-10-20T12:00:03".to_string(),
        ]
    );
    assert_eq!(summary.events, 4);
}

#[test]
fn test_replay_emits_lines_in_order() {
    let (lines, summary) = run_config(
        r#"
global:
  output:
    outputter: buf
    outputTemplate: raw
samples:
  - name: replaysample
    generator: replay
    begin: 2001-10-20 12:00:00
    end: 2001-10-20 12:00:40
    tokens:
      - name: ts
        type: timestamp
        format: regex
        token: (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})
        replacement: "%Y-%m-%d %H:%M:%S"
    lines:
      - _raw: 2001-10-20 12:00:00 line1
      - _raw: 2001-10-20 12:00:01 line2
      - _raw: 2001-10-20 12:00:06 line3
      - _raw: 2001-10-20 12:00:16 line4
      - _raw: 2001-10-20 12:00:36 line5
"#,
    );
    assert_eq!(summary.events, 5);
    assert_eq!(lines.len(), 5);
    for (idx, line) in lines.iter().enumerate() {
        assert!(
            line.ends_with(&format!("line{}", idx + 1)),
            "line {idx} out of order: {line}"
        );
    }
}

#[test]
fn test_stats_match_generated_volume() {
    let (lines, summary) = run_config(
        r#"
global:
  output:
    outputter: buf
    outputTemplate: raw
samples:
  - name: volume
    count: 3
    interval: 1
    endIntervals: 6
    tokens:
      - name: what
        type: static
        replacement: payload
    lines:
      - _raw: $what$
"#,
    );
    assert_eq!(summary.events, 18);
    assert_eq!(lines.len(), 18);
    // "payload\n" per event.
    assert_eq!(summary.bytes, 18 * 8);
}

#[test]
fn test_splunkhec_renames_through_pipeline() {
    let (lines, _) = run_config(
        r#"
global:
  output:
    outputter: buf
    outputTemplate: splunkhec
samples:
  - name: hecsample
    begin: 2001-10-20 00:00:00
    end: 2001-10-20 00:00:01
    interval: 1
    count: 1
    lines:
      - _raw: hec event body
        host: forge
        index: main
"#,
    );
    assert_eq!(lines.len(), 1);
    let event: HashMap<String, String> = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(event["event"], "hec event body");
    assert_eq!(event["host"], "forge");
    assert!(event.contains_key("time"), "system _time should be injected and renamed");
    assert!(!event.contains_key("_raw"));
    assert!(!event.contains_key("_time"));
}

#[test]
fn test_group_cohesion_across_pipeline() {
    let (lines, _) = run_config(
        r#"
global:
  output:
    outputter: buf
    outputTemplate: raw
samples:
  - name: grouped
    count: 20
    interval: 1
    endIntervals: 1
    tokens:
      - name: city
        type: fieldChoice
        group: 1
        srcField: city
        fieldChoice:
          - city: BOSTON
            zip: "2123"
          - city: HARTFORD
            zip: "6101"
          - city: PORTLAND
            zip: "4101"
      - name: zip
        type: fieldChoice
        group: 1
        srcField: zip
        fieldChoice:
          - city: BOSTON
            zip: "2123"
          - city: HARTFORD
            zip: "6101"
          - city: PORTLAND
            zip: "4101"
    lines:
      - _raw: city=$city$ zip=$zip$
"#,
    );
    assert_eq!(lines.len(), 20);
    let pairs = [
        ("BOSTON", "2123"),
        ("HARTFORD", "6101"),
        ("PORTLAND", "4101"),
    ];
    for line in &lines {
        assert!(
            pairs
                .iter()
                .any(|(city, zip)| line == &format!("city={city} zip={zip}")),
            "tokens of group 1 projected different rows: {line}"
        );
    }
}

#[test]
fn test_multiple_samples_run_concurrently() {
    let config = Config::from_yaml(
        r#"
global:
  generatorWorkers: 2
  outputWorkers: 2
  output:
    outputter: buf
    outputTemplate: raw
samples:
  - name: first
    count: 2
    interval: 1
    endIntervals: 3
    lines:
      - _raw: from-first
  - name: second
    count: 1
    interval: 1
    endIntervals: 4
    lines:
      - _raw: from-second
"#,
    )
    .unwrap();
    let pipeline = Pipeline::new(config, Arc::new(NullScriptHost)).unwrap();
    let buffers = pipeline.buffers();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let summary = runtime.block_on(pipeline.run());

    assert_eq!(summary.events, 2 * 3 + 4);
    let buffers = buffers.lock().unwrap();
    let first = String::from_utf8_lossy(buffers.get("first").unwrap());
    let second = String::from_utf8_lossy(buffers.get("second").unwrap());
    assert_eq!(first.lines().count(), 6);
    assert!(first.lines().all(|l| l == "from-first"));
    assert_eq!(second.lines().count(), 4);
    assert!(second.lines().all(|l| l == "from-second"));
}

#[test]
fn test_no_samples_is_fatal() {
    let config = Config::from_yaml("global: {}").unwrap();
    assert!(Pipeline::new(config, Arc::new(NullScriptHost)).is_err());
}
