use std::sync::Arc;

use emotion_analysis_client::prelude::*;
use emotion_analysis_client::init_observability;

struct Console;

impl SubmissionObserver for Console {
    fn on_progress(&self, percent: f64) {
        println!("upload {percent:.0}%");
    }

    fn on_message(&self, message: &str) {
        println!("server: {message}");
    }
}

impl SessionObserver for Console {
    fn on_progress(&self, fraction: f64) {
        println!("analysis {:.0}%", fraction * 100.0);
    }

    fn on_result(&self, result: &PartialResult) {
        println!(
            "clip {}/{}: {} ({:.1}%)",
            result.sequence,
            result.total,
            result.label.display_name(),
            result.confidence * 100.0
        );
    }

    fn on_error(&self, entry: &ErrorEntry) {
        eprintln!("{entry}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ClientError> {
    init_observability();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| ClientError::Validation("usage: analyze_video <file.mp4>".into()))?;
    let token = std::env::var("EMOTION_API_TOKEN")
        .map_err(|_| ClientError::Validation("set EMOTION_API_TOKEN".into()))?;
    let credential = Credential::bearer(token);
    let config = ClientConfig::from_env()?;

    let bytes = std::fs::read(&path)
        .map_err(|e| ClientError::Validation(format!("cannot read {path}: {e}")))?;
    let file_name = std::path::Path::new(&path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("video.mp4")
        .to_string();
    let console = Arc::new(Console);

    let handle = SubmissionClient::from_config(&config)?
        .observer(console.clone())
        .start_upload(
            UploadSource::new(file_name, "video/mp4", bytes),
            Some(credential.clone()),
        )?
        .finish()
        .await?;

    let session = JobSession::builder()
        .transport(Arc::new(HttpStreamTransport::new(config.clone())?))
        .reconnect(config.reconnect.clone())
        .observer(console)
        .build()?;
    session.start(handle, Some(credential)).await?;

    let done = session.wait_for_terminal().await;
    match done.aggregate {
        Some(aggregate) => {
            for (emotion, score) in aggregate.ranked() {
                println!("{:>12} {:.1}%", emotion.display_name(), score * 100.0);
            }
        }
        None => println!("finished as {:?} without an aggregate", done.phase),
    }
    Ok(())
}
