#![forbid(unsafe_code)]

//! Command-line client for a running tokgrab backend.
//!
//! Submits a TikTok URL, polls the job status once per second while showing
//! the synthetic progress ramp, and saves the finished file next to the
//! current directory. The server only ever reports coarse status, so the
//! percentage comes entirely from [`ProgressReporter`].

use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tokgrab_tools::jobs::JobStatus;
use tokgrab_tools::progress::{ProgressReporter, ReporterState};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone)]
struct ClientArgs {
    server: String,
    url: String,
    format: String,
    output: Option<PathBuf>,
}

impl ClientArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut server: Option<String> = None;
        let mut format: Option<String> = None;
        let mut output: Option<PathBuf> = None;
        let mut url: Option<String> = None;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--server=") {
                server = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--format=") {
                format = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--output=") {
                output = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--server" => {
                    server = Some(
                        args.next()
                            .ok_or_else(|| anyhow!("--server requires a value"))?,
                    );
                }
                "--format" => {
                    format = Some(
                        args.next()
                            .ok_or_else(|| anyhow!("--format requires a value"))?,
                    );
                }
                "--output" => {
                    output = Some(PathBuf::from(
                        args.next()
                            .ok_or_else(|| anyhow!("--output requires a value"))?,
                    ));
                }
                _ if arg.starts_with('-') => bail!("unknown argument: {arg}"),
                _ => {
                    if url.is_some() {
                        bail!("URL specified multiple times");
                    }
                    url = Some(arg);
                }
            }
        }

        let url = url.ok_or_else(|| {
            anyhow!(
                "Usage: download_video [--server <base-url>] [--format video|audio] [--output <path>] <tiktok-url>"
            )
        })?;
        let format = format.unwrap_or_else(|| "video".to_string());
        match format.as_str() {
            "video" | "audio" => {}
            other => bail!("unknown format: {other} (expected video or audio)"),
        }

        Ok(Self {
            server: server.unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            url,
            format,
            output,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    #[serde(default)]
    success: bool,
    download_id: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    download: StatusInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusInfo {
    status: JobStatus,
    title: Option<String>,
    file_size: Option<String>,
}

fn main() -> Result<()> {
    let args = ClientArgs::parse()?;
    let agent = ureq::agent();
    let mut reporter = ProgressReporter::new();
    let mut rng = rand::thread_rng();

    println!("Submitting {} ({})", args.url, args.format);
    match submit_download(&agent, &args) {
        Ok(download_id) => reporter.started(download_id),
        Err(err) => {
            reporter.submit_failed(format!("{err:#}"));
        }
    }

    let mut last_info: Option<StatusInfo> = None;
    while reporter.is_polling() {
        thread::sleep(POLL_INTERVAL);
        let id = reporter
            .download_id()
            .context("polling without a download id")?;
        match poll_status(&agent, &args.server, id) {
            Ok(info) => {
                reporter.observe(info.status, &mut rng);
                last_info = Some(info);
            }
            Err(err) => {
                // A single failed poll is not fatal; the next tick retries.
                eprintln!("\nWarning: status poll failed: {err:#}");
            }
        }
        render_progress(&reporter);
    }
    println!();

    match reporter.state() {
        ReporterState::Completed => {
            let id = reporter.download_id().context("missing download id")?;
            let path = fetch_file(&agent, &args, id, last_info.as_ref())?;
            println!("Saved to {}", path.display());
            if let Some(info) = &last_info
                && let Some(size) = &info.file_size
            {
                println!("File size: {size}");
            }
            Ok(())
        }
        ReporterState::Failed => {
            bail!(
                "{}",
                reporter.error().unwrap_or("Download failed").to_string()
            )
        }
        state => bail!("unexpected final state: {state:?}"),
    }
}

fn submit_download(agent: &ureq::Agent, args: &ClientArgs) -> Result<u64> {
    let endpoint = format!("{}/api/download", args.server);
    let request = serde_json::json!({
        "url": args.url,
        "format": args.format,
    });

    let response = match agent.post(&endpoint).send_json(request) {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => {
            let payload: StartResponse = response
                .into_json()
                .context("parsing error response from backend")?;
            bail!(
                "{}",
                payload.error.unwrap_or_else(|| "request rejected".into())
            );
        }
        Err(err) => return Err(err).context("reaching the backend"),
    };

    let payload: StartResponse = response
        .into_json()
        .context("parsing response from backend")?;
    if !payload.success {
        bail!(
            "{}",
            payload.error.unwrap_or_else(|| "request rejected".into())
        );
    }
    payload
        .download_id
        .context("backend did not return a download id")
}

fn poll_status(agent: &ureq::Agent, server: &str, id: u64) -> Result<StatusInfo> {
    let endpoint = format!("{server}/api/download/{id}/status");
    let payload: StatusResponse = agent
        .get(&endpoint)
        .call()
        .context("requesting job status")?
        .into_json()
        .context("parsing job status")?;
    Ok(payload.download)
}

fn render_progress(reporter: &ProgressReporter) {
    print!("\r[{:>3}%] {:<28}", reporter.percent(), reporter.phase_label());
    let _ = io::stdout().flush();
}

/// Downloads the finished file, preferring an explicit `--output` path, then
/// the server-suggested attachment name, then a bland default.
fn fetch_file(
    agent: &ureq::Agent,
    args: &ClientArgs,
    id: u64,
    last_info: Option<&StatusInfo>,
) -> Result<PathBuf> {
    let endpoint = format!("{}/api/download/{id}/file", args.server);
    let response = agent.get(&endpoint).call().context("fetching the file")?;

    let path = if let Some(path) = &args.output {
        path.clone()
    } else {
        let header_name = response
            .header("content-disposition")
            .and_then(parse_attachment_filename);
        let fallback = default_filename(last_info, &args.format);
        PathBuf::from(header_name.unwrap_or(fallback))
    };

    let mut reader = response.into_reader();
    let mut file =
        File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    io::copy(&mut reader, &mut file).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn default_filename(last_info: Option<&StatusInfo>, format: &str) -> String {
    let extension = if format == "audio" { "mp3" } else { "mp4" };
    let stem = last_info
        .and_then(|info| info.title.clone())
        .unwrap_or_else(|| "tiktok_video".to_string());
    format!("{stem}.{extension}")
}

/// Pulls the quoted filename out of `attachment; filename="..."`.
fn parse_attachment_filename(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=\"")?;
    let (name, _) = rest.split_once('"')?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
