use anyhow::Result;
use edgepick::config::{FetchConfig, LoadedTarget, parse_target_config};
use edgepick::fetch::{FetchFailure, Fetcher};
use edgepick::pipeline::{TargetOutcome, process_document, run_loaded_targets};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const TABLE: &str = "<html><body><table class=\"table-striped\">\
<tr><th>IP</th><th>Speed</th></tr>\
<tr><td>172.64.82.114</td><td>6.92mb/s</td></tr>\
<tr><td>104.16.1.8</td><td>12.5mb/s</td></tr>\
</table></body></html>";

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Answers one connection per scripted response, in order, each after its
/// delay. Received request heads are sent back lowercased.
fn serve(responses: Vec<(String, Duration)>) -> Result<(String, Receiver<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/cloudflare.html", listener.local_addr()?);
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (response, delay) in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let _ = tx.send(read_request_head(&mut stream).to_lowercase());
            thread::sleep(delay);
            let _ = stream.write_all(response.as_bytes());
        }
    });

    Ok((url, rx))
}

fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn fetch_config(timeout_secs: u64) -> FetchConfig {
    FetchConfig {
        timeout_secs,
        ..FetchConfig::default()
    }
}

#[test]
fn non_success_status_is_a_status_failure() -> Result<()> {
    let (url, _requests) = serve(vec![(
        http_response("503 Service Unavailable", "busy"),
        Duration::ZERO,
    )])?;

    let result = Fetcher::default().fetch_static(&url, &fetch_config(5));

    assert_eq!(result.outcome, Err(FetchFailure::Status(503)));
    assert_eq!(result.url, url);
    Ok(())
}

#[test]
fn stalled_response_times_out_with_the_configured_budget() -> Result<()> {
    let (url, _requests) = serve(vec![(
        http_response("200 OK", TABLE),
        Duration::from_secs(3),
    )])?;

    let started = Instant::now();
    let result = Fetcher::default().fetch_static(&url, &fetch_config(1));

    assert_eq!(
        result.outcome,
        Err(FetchFailure::Timeout(Duration::from_secs(1)))
    );
    assert!(started.elapsed() < Duration::from_millis(2_500));
    Ok(())
}

#[test]
fn refused_connection_is_a_connect_failure() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/", listener.local_addr()?);
    drop(listener);

    let result = Fetcher::default().fetch_static(&url, &fetch_config(2));

    assert!(
        matches!(result.outcome, Err(FetchFailure::Connect(_))),
        "got {:?}",
        result.outcome
    );
    Ok(())
}

#[test]
fn configured_headers_and_user_agent_are_sent() -> Result<()> {
    let (url, requests) = serve(vec![(http_response("200 OK", TABLE), Duration::ZERO)])?;
    let fetch = FetchConfig {
        user_agent: Some("edgepick-test/1.0".to_string()),
        headers: BTreeMap::from([("X-Edge-Region".to_string(), "hkg".to_string())]),
        ..fetch_config(5)
    };

    let result = Fetcher::default().fetch_static(&url, &fetch);

    assert_eq!(result.outcome.as_deref(), Ok(TABLE));
    let head = requests.recv_timeout(Duration::from_secs(1))?;
    assert!(head.starts_with("get /cloudflare.html"), "{head}");
    assert!(head.contains("user-agent: edgepick-test/1.0"), "{head}");
    assert!(head.contains("x-edge-region: hkg"), "{head}");
    Ok(())
}

#[test]
fn invalid_header_is_rejected_before_any_request() {
    let fetch = FetchConfig {
        headers: BTreeMap::from([("bad header".to_string(), "x".to_string())]),
        ..fetch_config(1)
    };

    let result = Fetcher::default().fetch_static("http://127.0.0.1:9/", &fetch);

    assert!(matches!(result.outcome, Err(FetchFailure::Request(_))));
}

fn static_target(url: &str, dir: &std::path::Path) -> Result<LoadedTarget> {
    let config = parse_target_config(&format!(
        r#"
[target]
key = "static"
name = "static table"
url = "{url}"

[fetch]
strategy = "static"
timeout_secs = 5
retry_attempts = 2
retry_backoff_ms = 10

[[schema]]
name = "two-column"
address = 0
speed = 1
header_hint = "ip"

[[output]]
path = "ip.txt"
"#
    ))?;
    Ok(LoadedTarget {
        path: dir.join("static.toml"),
        config,
    })
}

#[test]
fn fetched_table_flows_through_the_pipeline() -> Result<()> {
    let temp = tempdir()?;
    let (url, _requests) = serve(vec![(http_response("200 OK", TABLE), Duration::ZERO)])?;
    let target = static_target(&url, temp.path())?;

    let fetched = Fetcher::default().fetch_target(&target);
    let report = process_document(&target.config, fetched);

    assert_eq!(report.outcome, TargetOutcome::Selected);
    let addresses: Vec<&str> = report.records.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(addresses, vec!["104.16.1.8", "172.64.82.114"]);
    Ok(())
}

#[test]
fn failed_attempt_is_retried_as_a_whole() -> Result<()> {
    let temp = tempdir()?;
    let (url, requests) = serve(vec![
        (http_response("502 Bad Gateway", "upstream"), Duration::ZERO),
        (http_response("200 OK", TABLE), Duration::ZERO),
    ])?;
    let target = static_target(&url, temp.path())?;
    let out_dir = temp.path().join("out");

    let reports = run_loaded_targets(&[target], &Fetcher::default(), &out_dir, false);

    assert_eq!(reports[0].outcome, TargetOutcome::Selected);
    assert_eq!(requests.try_iter().count(), 2);
    assert_eq!(
        std::fs::read_to_string(out_dir.join("ip.txt"))?,
        "104.16.1.8\n172.64.82.114\n"
    );
    Ok(())
}
