//! TTFB (HEAD) and bulk-throughput (GET) probes over SOCKS5h, mirroring
//! the curl-based timings in `spec.md` §4.3.
//!
//! `reqwest` doesn't expose curl's per-phase timers directly, so
//! `connect_time` is measured with a short-lived raw SOCKS5 CONNECT to
//! the same proxy and target immediately before the HTTP request, and
//! `starttransfer_time`/`total_time` come from timing `reqwest`'s own
//! request lifecycle (headers-received vs. body-complete). This is an
//! approximation of curl's phases, not a byte-for-byte reproduction —
//! see DESIGN.md.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use reqwest::Url;

use crate::error::ProbeError;
use crate::record::TimingSample;

/// Expected byte size of the fixed bulk-throughput download target.
pub const BW_EXPECTED_BYTES: u64 = 5_242_880;

async fn measure_connect_time(
    socks_addr: (Ipv4Addr, u16),
    target: &Url,
) -> Result<f64, ProbeError> {
    let host = target
        .host_str()
        .ok_or_else(|| ProbeError::Transport("url has no host".into()))?
        .to_string();
    let port = target.port_or_known_default().unwrap_or(80);
    let start = Instant::now();
    let proxy = tokio::net::TcpStream::connect(socks_addr)
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    tokio_socks::tcp::Socks5Stream::connect_with_socket(proxy, (host.as_str(), port))
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    Ok(start.elapsed().as_secs_f64())
}

fn socks_proxy_url(socks_addr: (Ipv4Addr, u16)) -> String {
    format!("socks5h://{}:{}", socks_addr.0, socks_addr.1)
}

/// Issue a single HTTP HEAD to `url`, expecting an empty body and no
/// redirects, with a 120s connect+total timeout.
pub async fn ttfb_probe(socks_addr: (Ipv4Addr, u16), url: &str) -> TimingSample {
    match ttfb_probe_inner(socks_addr, url).await {
        Ok(sample) => sample,
        Err(e) => TimingSample::Error(e.to_string()),
    }
}

async fn ttfb_probe_inner(
    socks_addr: (Ipv4Addr, u16),
    url: &str,
) -> Result<TimingSample, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::Transport(e.to_string()))?;
    let connect_time = measure_connect_time(socks_addr, &parsed).await?;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(socks_proxy_url(socks_addr)).map_err(|e| ProbeError::Transport(e.to_string()))?)
        .user_agent("")
        .connect_timeout(Duration::from_secs(120))
        .timeout(Duration::from_secs(120))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProbeError::Transport(e.to_string()))?;

    let start = Instant::now();
    let resp = client
        .head(url)
        .send()
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    let starttransfer_time = start.elapsed().as_secs_f64();

    let redirects = resp.url() != &parsed;
    if redirects {
        return Err(ProbeError::UnexpectedResponse("HTTP redirects: 1".into()));
    }
    let content_length = resp.content_length().unwrap_or(0);
    let body = resp
        .bytes()
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    let total_time = start.elapsed().as_secs_f64();

    if content_length != 0 || !body.is_empty() {
        return Err(ProbeError::UnexpectedResponse(format!(
            "wrong response length: {}",
            content_length.max(body.len() as u64)
        )));
    }

    Ok(TimingSample::Timing {
        connect_time,
        starttransfer_time,
        total_time,
    })
}

/// Issue a single HTTP GET to `url`, expecting exactly
/// [`BW_EXPECTED_BYTES`] bytes and no redirects, with a 3600s total
/// timeout and `Accept-Encoding: identity`.
pub async fn bw_probe(socks_addr: (Ipv4Addr, u16), url: &str) -> TimingSample {
    match bw_probe_inner(socks_addr, url).await {
        Ok(sample) => sample,
        Err(e) => TimingSample::Error(e.to_string()),
    }
}

async fn bw_probe_inner(
    socks_addr: (Ipv4Addr, u16),
    url: &str,
) -> Result<TimingSample, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::Transport(e.to_string()))?;
    let connect_time = measure_connect_time(socks_addr, &parsed).await?;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(socks_proxy_url(socks_addr)).map_err(|e| ProbeError::Transport(e.to_string()))?)
        .user_agent("")
        .connect_timeout(Duration::from_secs(120))
        .timeout(Duration::from_secs(3600))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProbeError::Transport(e.to_string()))?;

    let start = Instant::now();
    let mut resp = client
        .get(url)
        .header("Accept-Encoding", "identity")
        .send()
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    let starttransfer_time = start.elapsed().as_secs_f64();

    if resp.url() != &parsed {
        return Err(ProbeError::UnexpectedResponse("HTTP redirects: 1".into()));
    }

    let mut downloaded: u64 = 0;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?
    {
        downloaded += chunk.len() as u64;
    }
    let total_time = start.elapsed().as_secs_f64();

    // Per spec.md §9, this compares against the bytes actually
    // downloaded, not the symbolic BW_EXPECTED_BYTES constant on both
    // sides of the check.
    if downloaded != BW_EXPECTED_BYTES {
        return Err(ProbeError::UnexpectedResponse(format!(
            "wrong response length: {downloaded}"
        )));
    }

    Ok(TimingSample::Timing {
        connect_time,
        starttransfer_time,
        total_time,
    })
}
