use shadowtrace_types::TraceRecord;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Maximum number of records written between two flushes.
const BATCH: usize = 256;

/// Output format of trace records, one record per line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    /// JSON object per line.
    #[default]
    Json,

    /// Human-readable line.
    Text,
}

impl FromStr for TraceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(TraceFormat::Json),
            "text" => Ok(TraceFormat::Text),
            _ => Err(format!("unknown trace format {s:?}, expected json or text")),
        }
    }
}

impl TraceFormat {
    /// Format a record as a single line, including the final newline.
    pub fn format(&self, record: &TraceRecord) -> Option<String> {
        match self {
            TraceFormat::Text => Some(format!("{record}\n")),
            TraceFormat::Json => match serde_json::to_string(record) {
                Ok(mut line) => {
                    line.push('\n');
                    Some(line)
                }
                Err(err) => {
                    log::warn!("Cannot serialize trace record {record}: {err}");
                    None
                }
            },
        }
    }
}

/// Open the sink trace records are written to.
///
/// Records are appended to `output`, if specified, or written to
/// stdout.
pub async fn open_sink(
    output: Option<&Path>,
) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
    match output {
        None => Ok(Box::new(tokio::io::stdout())),
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;

            Ok(Box::new(file))
        }
    }
}

/// Write records to `out` until all emitters are gone.
///
/// Write errors are logged and the records lost; the queue keeps being
/// drained so producers never see a full queue because of a broken
/// sink.
pub async fn run<W>(mut rx: mpsc::Receiver<TraceRecord>, mut out: W, format: TraceFormat)
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(BATCH);
    let mut failing = false;
    while rx.recv_many(&mut batch, BATCH).await > 0 {
        let mut buf = String::new();
        for record in batch.drain(..) {
            if let Some(line) = format.format(&record) {
                buf.push_str(&line);
            }
        }
        let res = match out.write_all(buf.as_bytes()).await {
            Ok(()) => out.flush().await,
            Err(err) => Err(err),
        };
        match res {
            Ok(()) => {
                if failing {
                    log::info!("Trace output recovered");
                    failing = false;
                }
            }
            Err(err) => {
                if !failing {
                    log::warn!("Failed to write trace records: {err}");
                    failing = true;
                }
            }
        }
    }
    if let Err(err) = out.shutdown().await {
        log::debug!("Failed to close trace output: {err}");
    }
}
