mod cli;
mod progress_view;

use std::collections::HashMap;
use std::process;
use std::time::Duration;

use clap::Parser;
use sluice::{DownloadConfig, Downloader, Media, Stream, StreamKind};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::progress_view::ProgressView;

/// Parse repeated `NAME:VALUE` flags into a header map.
fn header_pairs(flags: &[String]) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    for flag in flags {
        let (name, value) = flag
            .split_once(':')
            .ok_or_else(|| format!("invalid header `{flag}`, expected NAME:VALUE"))?;
        headers.insert(name.trim().to_owned(), value.trim().to_owned());
    }
    Ok(headers)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let headers = header_pairs(&args.headers)?;
    let medias = load_medias(&args.input, &headers)?;

    if args.info {
        print_media_info(&medias);
        return Ok(());
    }

    let mut config = DownloadConfig {
        output_path: args.output_path,
        output_name: args.output_name,
        quality: args.quality,
        format: args.format,
        cookie_file: args.cookies,
        retry_count: args.retries,
        timeout: Duration::from_secs(args.timeout),
        threads: args.threads,
        chunk_size: args.chunk_size,
        rate_limit: args.rate_limit,
        skip_existing: args.skip_existing,
        playlist_start: args.playlist_start,
        playlist_end: args.playlist_end,
        subtitle: args.subtitle,
        audio_only: args.audio_only,
        video_only: args.video_only,
        ignore_errors: args.ignore_errors,
        no_cache: args.no_cache,
        proxy: args.proxy,
        ..Default::default()
    };
    if let Some(user_agent) = args.user_agent {
        config.user_agent = user_agent;
    }
    config.headers = sluice::util::header_map(&headers);

    let mut downloader = Downloader::new(config)?;
    let view = ProgressView::new();
    downloader.set_progress_callback(view.callback());

    let token = downloader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });

    let ignore_errors = downloader.config().ignore_errors;
    for media in &medias {
        info!(title = %media.title, "downloading media");
        match downloader.download(media).await {
            Ok(()) => {}
            Err(sluice::DownloadError::Cancelled) => {
                view.finish();
                eprintln!("Cancelled. Partial files kept for resume.");
                process::exit(130);
            }
            Err(e) if ignore_errors => error!(title = %media.title, error = %e, "media failed"),
            Err(e) => {
                view.finish();
                return Err(e.into());
            }
        }
    }
    view.finish();
    Ok(())
}

/// Build the media list: a `.json` manifest is decoded as extractor output
/// (a single media item or a list); anything else is treated as a direct
/// URL wrapped in a one-stream media item.
fn load_medias(
    input: &str,
    headers: &HashMap<String, String>,
) -> Result<Vec<Media>, Box<dyn std::error::Error>> {
    let path = std::path::Path::new(input);
    if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) && path.exists() {
        let content = std::fs::read_to_string(path)?;
        if let Ok(list) = serde_json::from_str::<Vec<Media>>(&content) {
            return Ok(list);
        }
        let media: Media = serde_json::from_str(&content)?;
        return Ok(vec![media]);
    }

    if !input.starts_with("http://") && !input.starts_with("https://") {
        return Err(format!("not a URL or manifest file: {input}").into());
    }

    let (title, format) = name_from_url(input);
    let kind = if input.contains(".m3u8") {
        StreamKind::Hls
    } else {
        StreamKind::Video
    };
    Ok(vec![Media {
        title: title.clone(),
        streams: vec![Stream {
            id: "0".into(),
            title,
            kind,
            url: input.to_owned(),
            format,
            quality: String::new(),
            size: None,
            duration: None,
            headers: headers.clone(),
            save_as: None,
        }],
        thumbnail: None,
        description: None,
    }])
}

fn name_from_url(url: &str) -> (String, String) {
    let tail = url
        .split('/')
        .next_back()
        .and_then(|s| s.split(['?', '#']).next())
        .unwrap_or("download");
    match tail.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 5 => {
            let format = if ext.eq_ignore_ascii_case("m3u8") {
                "ts".to_owned()
            } else {
                ext.to_ascii_lowercase()
            };
            (stem.to_owned(), format)
        }
        _ => ("download".to_owned(), "mp4".to_owned()),
    }
}

fn print_media_info(medias: &[Media]) {
    if medias.is_empty() {
        println!("No media information available.");
        return;
    }
    for media in medias {
        println!("Title: {}", media.title);
        for (i, stream) in media.streams.iter().enumerate() {
            println!("  Stream #{}:", i + 1);
            println!("    Kind:    {:?}", stream.kind);
            println!("    Quality: {}", stream.quality);
            println!("    Format:  {}", stream.format);
            match stream.size {
                Some(size) => println!("    Size:    {}", sluice::util::format_bytes(size)),
                None => println!("    Size:    unknown"),
            }
            println!("    URL:     {}", stream.url);
        }
        println!();
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
