use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures_util::{StreamExt, pin_mut};
use restream_events::FileEventSource;
use restream_metadata::{HttpMetadataService, OfflineMetadataService, PageTitleService};
use restream_protocol::{ClockPhase, MetadataServicePort, RawEvent, SessionId};
use restream_runtime::{EngineConfig, FileKvStore, ResearchSession, SessionPorts};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Resolver {
    /// Ask a `{title, favicon}` endpoint (requires `--metadata-endpoint`).
    Service,
    /// Fetch each page and read its `<title>`.
    PageTitle,
    /// Never go to the network; hostname titles only.
    Offline,
}

#[derive(Debug, Parser)]
#[command(name = "restreamd")]
#[command(about = "Follow a research agent's progress events")]
struct Cli {
    /// JSONL file the agent appends events to.
    #[arg(long)]
    source: PathBuf,
    /// Session id; defaults to the source file stem.
    #[arg(long)]
    session: Option<String>,
    #[arg(long, default_value = ".restream")]
    state_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = Resolver::Offline)]
    resolver: Resolver,
    #[arg(long)]
    metadata_endpoint: Option<String>,
    #[arg(long, default_value_t = 3000)]
    metadata_timeout_ms: u64,
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
    #[arg(long, default_value = restream_runtime::DEFAULT_NAMESPACE)]
    namespace: String,
    #[arg(long)]
    hide_unknown: bool,
    /// Process the file once and exit instead of following it.
    #[arg(long)]
    once: bool,
    /// How long to wait for pending metadata before exiting.
    #[arg(long, default_value_t = 2000)]
    drain_ms: u64,
}

impl Cli {
    fn session_id(&self) -> SessionId {
        match &self.session {
            Some(session) => SessionId::from_string(session.clone()),
            None => self
                .source
                .file_stem()
                .map(|stem| SessionId::from_string(stem.to_string_lossy().into_owned()))
                .unwrap_or_else(SessionId::new_uuid),
        }
    }

    fn metadata_service(&self) -> Result<Arc<dyn MetadataServicePort>> {
        let timeout = Duration::from_millis(self.metadata_timeout_ms);
        Ok(match self.resolver {
            Resolver::Service => {
                let endpoint = self
                    .metadata_endpoint
                    .as_deref()
                    .context("--resolver service requires --metadata-endpoint")?;
                Arc::new(HttpMetadataService::new(endpoint, timeout)?)
            }
            Resolver::PageTitle => Arc::new(PageTitleService::new(timeout)?),
            Resolver::Offline => Arc::new(OfflineMetadataService),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();

    let config = EngineConfig::new()
        .namespace(cli.namespace.clone())
        .show_unknown(!cli.hide_unknown);
    let ports = SessionPorts {
        metadata: cli.metadata_service()?,
        store: Arc::new(FileKvStore::new(&cli.state_dir)),
    };
    let session = ResearchSession::mount(cli.session_id(), config, ports).await;
    info!(session_id = %session.session_id(), source = ?cli.source, "following event source");

    let mut updates = session.subscribe();
    let update_task = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            let rendered = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_owned());
            info!(update = %rendered, "timeline.update");
        }
    });

    let source = FileEventSource::new(&cli.source);
    let poll = Duration::from_millis(cli.poll_ms);
    let once = cli.once;
    let batches = async_stream::stream! {
        loop {
            yield source.read_all().await;
            if once {
                break;
            }
            tokio::time::sleep(poll).await;
        }
    };
    pin_mut!(batches);

    loop {
        let batch: Option<Result<Vec<RawEvent>>> = tokio::select! {
            batch = batches.next() => batch,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            }
        };
        let Some(batch) = batch else {
            break;
        };
        let events = match batch {
            Ok(events) => events,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed reading event source");
                continue;
            }
        };

        let outcome = session.on_source(&events).await;
        for event in &outcome.appended {
            info!(sequence = event.sequence, label = event.kind.label(), "step");
        }
        if outcome.phase == ClockPhase::Completed {
            info!(
                elapsed = session.state().elapsed_seconds,
                "research completed"
            );
            break;
        }
    }

    drain_metadata(&session, Duration::from_millis(cli.drain_ms)).await;
    let rows = serde_json::to_string_pretty(&session.rows()).context("failed rendering rows")?;
    println!("{rows}");

    session.teardown().await;
    update_task.abort();
    if let Err(error) = update_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "update task stopped");
    }

    Ok(())
}

async fn drain_metadata(session: &ResearchSession, budget: Duration) {
    let settled = tokio::time::timeout(budget, async {
        while session
            .rows()
            .iter()
            .flat_map(|row| &row.urls)
            .any(|url| !url.resolved)
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if settled.is_err() {
        warn!("metadata still pending at exit");
    }
}
