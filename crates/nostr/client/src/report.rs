//! Moderation report submission.
//!
//! The signed kind-1984 event is the canonical record and its publish failures reach the
//! caller. The optional mirror gets the plain report fields in the background; its
//! failures are only logged.

use crate::error::{ClientError, ReportError, Result};
use crate::signer::SigningPipeline;
use crate::transport::{PublishReport, RelayTransport};
use async_trait::async_trait;
use nostr::{Event, Report};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives a plain copy of every submitted report.
#[async_trait]
pub trait ReportMirror: Send + Sync {
    async fn mirror(&self, report: &Report) -> Result<()>;
}

/// Posts reports as JSON to an HTTP endpoint.
pub struct HttpReportMirror {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReportMirror {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| ClientError::Config(format!("http client: {}", error)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReportMirror for HttpReportMirror {
    async fn mirror(&self, report: &Report) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(report)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| ClientError::Connection(format!("report mirror: {}", error)))?;
        Ok(())
    }
}

/// A report that reached at least one relay.
#[derive(Debug)]
pub struct SubmittedReport {
    pub event: Event,
    pub publish: PublishReport,
    /// Background mirror task, if a mirror is configured.
    pub mirror_task: Option<JoinHandle<()>>,
}

pub struct ReportSubmitter {
    signer: Arc<SigningPipeline>,
    transport: Arc<dyn RelayTransport>,
    mirror: Option<Arc<dyn ReportMirror>>,
}

impl ReportSubmitter {
    pub fn new(signer: Arc<SigningPipeline>, transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            signer,
            transport,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ReportMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Sign `report`, publish it to the configured relays and mirror it.
    ///
    /// The mirror starts once the event is signed and is never awaited here.
    pub async fn submit(&self, report: &Report) -> std::result::Result<SubmittedReport, ReportError> {
        let draft = report.to_unsigned_event()?;
        let event = self.signer.sign(&draft).await?;

        let mirror_task = self.mirror.as_ref().map(|mirror| {
            let mirror = Arc::clone(mirror);
            let report = report.clone();
            tokio::spawn(async move {
                match mirror.mirror(&report).await {
                    Ok(()) => debug!("mirrored report on {}", report.target_id),
                    Err(error) => warn!("report mirror failed for {}: {}", report.target_id, error),
                }
            })
        });

        let relays = self.transport.relay_urls().await;
        let publish = self.transport.publish(&relays, &event).await?;
        if !publish.any_accepted() {
            return Err(ReportError::NotAccepted {
                event_id: event.id,
                reasons: publish.failure_summary(),
            });
        }
        info!(
            "report {} accepted by {} of {} relays",
            event.id,
            publish.accepted_count(),
            publish.outcomes.len()
        );
        Ok(SubmittedReport {
            event,
            publish,
            mirror_task,
        })
    }
}
