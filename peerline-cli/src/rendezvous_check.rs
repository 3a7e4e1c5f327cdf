//! A small protocol conformance tester for a rendezvous server: sends one
//! line per test case and checks the raw/JSON response against an
//! `expect` block. Each case is `{"send": ..., "expect": {...}}`, with an
//! optional `"mode"` (`json` default, `raw`, or `synth`) controlling how
//! `send` becomes a wire payload.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub async fn run(file: &Path, host: &str, port: u16, timeout_secs: f64, delay_secs: f64) -> Result<()> {
    let cases = load_cases(file)?;
    let socket_timeout = Duration::from_secs_f64(timeout_secs);
    let delay = Duration::from_secs_f64(delay_secs);

    let mut total = 0;
    let mut passed = 0;
    let mut failed = 0;

    for (i, case) in cases.iter().enumerate() {
        let idx = i + 1;
        let name = case
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("case-{idx}"));
        let expect = case.get("expect").cloned().unwrap_or(Value::Object(Default::default()));
        let payload = match build_payload(case) {
            Ok(p) => p,
            Err(err) => {
                println!("\n[{idx}] {name}\n\u{2716} bad test case: {err}");
                failed += 1;
                total += 1;
                continue;
            }
        };

        total += 1;
        let preview = preview(&payload, 200);
        println!("\n[{idx}] {name}\n\u{27a4} Sending: {preview}");

        match send_and_recv_once(host, port, &payload, socket_timeout).await {
            Ok((elapsed, response)) => {
                println!("\u{21e6} Received ({:.1} ms): {}", elapsed.as_secs_f64() * 1000.0, preview(&response, 300));
                match validate_response(&response, &expect) {
                    Ok(()) => {
                        println!("\u{2714} PASS");
                        passed += 1;
                    }
                    Err(why) => {
                        println!("\u{2716} FAIL: {why}");
                        failed += 1;
                    }
                }
            }
            Err(err) => {
                println!("\u{2716} Connection error: {err}");
                failed += 1;
            }
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    println!("\n==== Summary ====");
    println!("Total: {total} | Passed: {passed} | Failed: {failed}");

    if failed > 0 {
        bail!("{failed} of {total} rendezvous conformance case(s) failed");
    }
    Ok(())
}

fn load_cases(path: &Path) -> Result<Vec<Value>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let data: Value = serde_json::from_str(&contents).context("parsing test file as JSON")?;
    let cases = data.as_array().ok_or_else(|| anyhow!("test file must be a JSON array of cases"))?;
    for (i, case) in cases.iter().enumerate() {
        let has_send_expect = case.get("send").is_some() && case.get("expect").is_some();
        let is_synth_only = case.get("send").is_none() && case.get("synth").is_some();
        if !has_send_expect && !is_synth_only {
            bail!("case {} must be an object with 'send' and 'expect'", i + 1);
        }
    }
    Ok(cases.clone())
}

fn build_payload(case: &Value) -> Result<String> {
    let mode = case.get("mode").and_then(|v| v.as_str()).unwrap_or("json");
    match mode {
        "json" => {
            let send = case.get("send").ok_or_else(|| anyhow!("missing 'send'"))?;
            Ok(serde_json::to_string(send)?)
        }
        "raw" => Ok(case.get("send").and_then(|v| v.as_str()).unwrap_or_default().to_string()),
        "synth" => {
            let cfg = case.get("synth").cloned().unwrap_or(Value::Object(Default::default()));
            let pattern = cfg.get("pattern").and_then(|v| v.as_str());
            match pattern {
                Some("curly_a") => {
                    let count = cfg.get("count").and_then(|v| v.as_u64()).unwrap_or(33_000) as usize;
                    Ok(format!("{{{}}}", "a".repeat(count)))
                }
                other => bail!("unknown synth pattern: {other:?}"),
            }
        }
        other => bail!("unknown mode: {other}"),
    }
}

async fn send_and_recv_once(
    host: &str,
    port: u16,
    payload: &str,
    socket_timeout: Duration,
) -> Result<(Duration, String)> {
    let start = std::time::Instant::now();
    let fut = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(payload.as_bytes()).await?;
        stream.write_all(b"\n").await?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match timeout(socket_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(anyhow!(err)),
                Err(_) => break,
            }
        }
        Ok::<_, anyhow::Error>(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string())
    };

    let response = timeout(socket_timeout, fut).await.map_err(|_| anyhow!("connection timed out"))??;
    Ok((start.elapsed(), response))
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}\u{2026}", s.chars().take(max).collect::<String>())
    }
}

fn validate_response(raw: &str, expect: &Value) -> Result<(), String> {
    if let Some(pat) = expect.get("regex").and_then(|v| v.as_str()) {
        let re = regex::Regex::new(pat).map_err(|e| format!("invalid regex '{pat}': {e}"))?;
        if !re.is_match(raw) {
            return Err(format!("regex '{pat}' not matched"));
        }
    }

    let parsed: Option<Value> = serde_json::from_str(raw).ok();

    if let Some(equals) = expect.get("equals") {
        let j = parsed.as_ref().ok_or("expected JSON equals but got non-JSON")?;
        if j != equals {
            return Err("JSON is not equal to expected".to_string());
        }
    }
    if let Some(subset) = expect.get("subset") {
        let j = parsed.as_ref().ok_or("expected JSON subset but got non-JSON")?;
        if !match_subset(j, subset) {
            return Err("JSON does not include expected subset".to_string());
        }
    }
    if let Some(keys) = expect.get("has").and_then(|v| v.as_array()) {
        let j = parsed.as_ref().ok_or("expected JSON but got non-JSON")?;
        let missing: Vec<&str> = keys
            .iter()
            .filter_map(|k| k.as_str())
            .filter(|k| j.get(k).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(format!("JSON missing keys: {missing:?}"));
        }
    }
    if let Some(types) = expect.get("types").and_then(|v| v.as_object()) {
        let j = parsed.as_ref().ok_or("expected JSON but got non-JSON")?;
        for (key, tname) in types {
            let Some(tname) = tname.as_str() else { continue };
            let Some(val) = j.get(key) else {
                return Err(format!("JSON type check failed for: {key}"));
            };
            if !matches_type(val, tname) {
                return Err(format!("JSON type check failed for: {key}"));
            }
        }
    }
    if let Some(status) = expect.get("status") {
        let j = parsed.as_ref().ok_or("expected JSON status but got non-JSON")?;
        if j.get("status") != Some(status) {
            return Err(format!("status={:?} != {status:?}", j.get("status")));
        }
    }
    Ok(())
}

fn matches_type(val: &Value, tname: &str) -> bool {
    match tname {
        "str" => val.is_string(),
        "int" => val.is_i64() || val.is_u64(),
        "list" => val.is_array(),
        "dict" => val.is_object(),
        "float" => val.is_f64(),
        "number" => val.is_number(),
        "bool" => val.is_boolean(),
        _ => false,
    }
}

fn match_subset(resp: &Value, subset: &Value) -> bool {
    match subset {
        Value::Object(map) => {
            let Value::Object(resp_map) = resp else { return false };
            map.iter().all(|(k, v)| resp_map.get(k).is_some_and(|rv| match_subset(rv, v)))
        }
        Value::Array(items) => {
            let Value::Array(resp_items) = resp else { return false };
            items.iter().all(|exp_item| resp_items.iter().any(|r_item| match_subset(r_item, exp_item)))
        }
        other => resp == other,
    }
}
