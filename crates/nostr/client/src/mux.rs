//! One-stop wiring of pool, registry, signing pipeline and report submission.

use crate::config::MuxConfig;
use crate::error::{ClientError, PublishError, ReportError, Result, SignError};
use crate::pool::RelayPool;
use crate::registry::{EventCallback, SubscriptionHandle, SubscriptionRegistry};
use crate::remote_signer::RemoteSignerClient;
use crate::report::{HttpReportMirror, ReportSubmitter, SubmittedReport};
use crate::signer::{SigningMethod, SigningPipeline};
use crate::transport::{PublishReport, RelayTransport};
use nostr::{Event, EventTemplate, Filter, Keys, Report, UnsignedEvent};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// How the mux should sign.
#[derive(Debug, Clone, Default)]
pub enum SignerSetup {
    /// Read-only: every sign attempt fails with `Unavailable`.
    #[default]
    None,
    Local(Keys),
    /// Remote signer holding `signer_pubkey`. Requests are signed with `client_keys`,
    /// or a fresh throwaway key when absent.
    Remote {
        signer_pubkey: String,
        client_keys: Option<Keys>,
    },
}

pub struct NostrMux {
    config: MuxConfig,
    pool: Arc<RelayPool>,
    registry: Arc<SubscriptionRegistry>,
    signer: Arc<SigningPipeline>,
    reports: ReportSubmitter,
    pump: JoinHandle<()>,
}

impl NostrMux {
    /// Connect to the configured relays and start routing inbound events.
    pub async fn start(config: MuxConfig, setup: SignerSetup) -> Result<Self> {
        let pool = Arc::new(RelayPool::new(config.pool_config()));
        if pool.add_relays(&config.relays).await == 0 {
            return Err(ClientError::NoRelays);
        }
        let inbound = pool
            .take_inbound()
            .ok_or_else(|| ClientError::Internal("inbound stream already taken".to_string()))?;

        let transport: Arc<dyn RelayTransport> = pool.clone();
        let registry = SubscriptionRegistry::new(Arc::clone(&transport), config.registry_config());
        let pump = registry.spawn_pump(inbound);

        let method = match setup {
            SignerSetup::None => None,
            SignerSetup::Local(keys) => Some(SigningMethod::Local(keys)),
            SignerSetup::Remote {
                signer_pubkey,
                client_keys,
            } => {
                let remote_config = config.remote_signer_config();
                let client = match client_keys {
                    Some(keys) => RemoteSignerClient::new(Arc::clone(&registry), keys, remote_config),
                    None => RemoteSignerClient::ephemeral(Arc::clone(&registry), remote_config),
                };
                Some(SigningMethod::Remote {
                    client: Arc::new(client),
                    signer_pubkey,
                })
            }
        };
        let signer = Arc::new(SigningPipeline::new(method));

        let mut reports = ReportSubmitter::new(Arc::clone(&signer), transport);
        if let Some(url) = &config.report_mirror_url {
            reports = reports.with_mirror(Arc::new(HttpReportMirror::new(url.clone())?));
        }

        info!("nostr mux started with {} relays", config.relays.len());
        Ok(Self {
            config,
            pool,
            registry,
            signer,
            reports,
            pump,
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn signer(&self) -> &Arc<SigningPipeline> {
        &self.signer
    }

    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<SubscriptionHandle> {
        self.registry.register(filters).await
    }

    pub async fn subscribe_callback(
        &self,
        filters: Vec<Filter>,
        callback: EventCallback,
    ) -> Result<SubscriptionHandle> {
        self.registry.register_callback(filters, callback).await
    }

    pub async fn sign(&self, draft: &UnsignedEvent) -> std::result::Result<Event, SignError> {
        self.signer.sign(draft).await
    }

    /// Publish an already signed event to every configured relay.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport> {
        let relays = self.pool.relay_urls().await;
        self.pool.publish(&relays, event).await
    }

    /// Sign `template` with the configured method and publish it.
    pub async fn sign_and_publish(
        &self,
        template: &EventTemplate,
    ) -> std::result::Result<(Event, PublishReport), PublishError> {
        let event = self.signer.sign_template(template).await?;
        let report = self.publish(&event).await?;
        Ok((event, report))
    }

    pub async fn submit_report(
        &self,
        report: &Report,
    ) -> std::result::Result<SubmittedReport, ReportError> {
        self.reports.submit(report).await
    }

    /// Stop routing and close every relay.
    pub async fn shutdown(&self) {
        self.pump.abort();
        self.pool.shutdown().await;
    }
}
