use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tubegrab::{
    client::{ClientError, DownloadClient, QuotaSnapshot},
    progress::ProgressSnapshot,
    transfer::MediaKind,
};

#[derive(Parser)]
#[command(version, about = "Download audio or video through a tubegrab server")]
struct Args {
    /// Video URL to fetch
    url: String,

    #[arg(long, help = "Download the audio-only rendition")]
    audio: bool,

    #[arg(long, short = 'q', help = "highest, lowest, highestaudio, ... or a label such as 720p")]
    quality: Option<String>,

    #[arg(long, help = "Session token for unlimited downloads")]
    token: Option<String>,

    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server: String,

    #[arg(long, short = 'o', help = "Output path; defaults to the server-provided filename")]
    output: Option<PathBuf>,

    #[arg(long, help = "Only print the video details")]
    info: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(ClientError::LimitReached { message, .. }) => {
            eprintln!("{message}");
            ExitCode::from(2)
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), ClientError> {
    let mut client = DownloadClient::new(&args.server, args.token)?;

    if args.info {
        let info = client.info(&args.url).await?.data;
        println!("{}", info.title);
        println!(
            "  author: {}  duration: {}s  views: {}",
            info.author.as_deref().unwrap_or("-"),
            info.duration,
            info.view_count.map_or_else(|| "-".to_string(), |views| views.to_string())
        );
        for format in info.formats {
            println!(
                "  {:>6}  {:<8} {:<5} audio={} video={}",
                format.itag,
                format.quality.as_deref().unwrap_or("-"),
                format.container,
                format.has_audio,
                format.has_video
            );
        }
        print_quota(client.last_quota());
        return Ok(());
    }

    let kind = if args.audio {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };

    let mut last_reported = -1_i64;
    let file = client
        .download(&args.url, kind, args.quality.as_deref(), |snapshot| {
            let whole = snapshot.percent.floor() as i64;
            if whole != last_reported {
                last_reported = whole;
                eprintln!("{}", progress_line(&snapshot));
            }
        })
        .await?;

    let path = args.output.unwrap_or_else(|| PathBuf::from(&file.filename));
    tokio::fs::write(&path, &file.bytes)
        .await
        .map_err(|error| ClientError::Failed(format!("could not write {}: {error}", path.display())))?;

    println!("Saved {} ({} bytes)", path.display(), file.bytes.len());
    print_quota(file.quota);
    Ok(())
}

fn progress_line(snapshot: &ProgressSnapshot) -> String {
    match snapshot.eta {
        Some(eta) if snapshot.percent < 100.0 => format!(
            "[{:<11}] {:>3}%  ETA {}s",
            snapshot.phase.label(),
            snapshot.percent.round(),
            eta.as_secs()
        ),
        _ => format!(
            "[{:<11}] {:>3}%",
            snapshot.phase.label(),
            snapshot.percent.round()
        ),
    }
}

fn print_quota(quota: Option<QuotaSnapshot>) {
    match quota {
        Some(QuotaSnapshot::Unlimited) => println!("Downloads: unlimited"),
        Some(QuotaSnapshot::Metered {
            limit, remaining, ..
        }) => println!("Downloads remaining: {remaining} of {limit}"),
        None => {}
    }
}
