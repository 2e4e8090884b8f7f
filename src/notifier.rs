use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::{ChannelKind, NotificationConfig, SmtpConfig};
use crate::error::DeployError;
use crate::models::notification::{ChannelDelivery, DeliveryReport, NotificationEvent};
use crate::retry::RetryPolicy;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, title: &str, body: &str) -> anyhow::Result<()>;
}

// ── Channels ──

/// Generic JSON webhook: `{"title": .., "body": ..}`.
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: &str, url: &str, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "title": title, "body": body });
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Slack incoming webhook.
pub struct SlackChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "text": format!("*{title}*\n{body}") });
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct EmailChannel {
    name: String,
    to: String,
    from: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

fn build_smtp_transport(cfg: &SmtpConfig) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(builder.build())
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.from.parse()?)
            .to(self.to.parse()?)
            .subject(title)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        self.transport.send(email).await?;
        Ok(())
    }
}

// ── Dispatcher ──

pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            channels,
            timeout,
            retry,
        }
    }

    pub fn from_config(cfg: &NotificationConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        let smtp = match &cfg.smtp {
            Some(smtp) => Some((build_smtp_transport(smtp)?, smtp.from.clone())),
            None => None,
        };
        if smtp.is_some() {
            tracing::info!("notifier: SMTP configured for email notifications");
        }

        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        for ch in &cfg.channels {
            match ch.kind {
                ChannelKind::Webhook => {
                    let url = ch.url.as_deref().unwrap_or_default();
                    channels.push(Arc::new(WebhookChannel::new(&ch.name, url, client.clone())));
                }
                ChannelKind::Slack => channels.push(Arc::new(SlackChannel {
                    name: ch.name.clone(),
                    url: ch.url.clone().unwrap_or_default(),
                    client: client.clone(),
                })),
                ChannelKind::Email => {
                    let Some((transport, from)) = &smtp else {
                        anyhow::bail!("channel {}: email channel configured but SMTP not set up", ch.name);
                    };
                    channels.push(Arc::new(EmailChannel {
                        name: ch.name.clone(),
                        to: ch.to.clone().unwrap_or_default(),
                        from: from.clone(),
                        transport: transport.clone(),
                    }));
                }
            }
        }
        Ok(Self::new(channels, Duration::from_secs(cfg.timeout_secs), retry))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver to every channel concurrently. Individual failures are
    /// recorded in the report and never returned as an error.
    pub async fn notify(&self, event: &NotificationEvent) -> DeliveryReport {
        if self.channels.is_empty() {
            tracing::debug!("notifier: no channels configured, dropping {}", event.event_type.as_str());
            return DeliveryReport {
                event_type: event.event_type,
                deliveries: Vec::new(),
            };
        }

        let title = event.rendered_title();
        let body = event.rendered_body();
        let sends: Vec<_> = self
            .channels
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, channel)| {
                let title = title.as_str();
                let body = body.as_str();
                async move { (idx, self.deliver(channel.as_ref(), title, body).await) }
            })
            .collect();
        let mut deliveries: Vec<(usize, ChannelDelivery)> = stream::iter(sends)
            .buffer_unordered(self.channels.len())
            .collect()
            .await;
        deliveries.sort_by_key(|(idx, _)| *idx);

        let report = DeliveryReport {
            event_type: event.event_type,
            deliveries: deliveries.into_iter().map(|(_, d)| d).collect(),
        };
        if report.failed_count() > 0 {
            tracing::warn!(
                "notifier: {} delivered to {}/{} channels",
                event.event_type.as_str(),
                report.delivered_count(),
                report.deliveries.len()
            );
        }
        report
    }

    async fn deliver(&self, channel: &dyn NotificationChannel, title: &str, body: &str) -> ChannelDelivery {
        let attempts = AtomicU32::new(0);
        let label = format!("notify {}", channel.name());
        let outcome = self
            .retry
            .retry(&label, |_| {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    match tokio::time::timeout(self.timeout, channel.send(title, body)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(DeployError::NotificationDelivery {
                            channel: channel.name().to_string(),
                            reason: e.to_string(),
                        }),
                        Err(_) => Err(DeployError::NotificationDelivery {
                            channel: channel.name().to_string(),
                            reason: format!("timed out after {}s", self.timeout.as_secs()),
                        }),
                    }
                }
            })
            .await;

        let error = outcome.err().map(|e| {
            tracing::warn!("{e}");
            e.to_string()
        });
        ChannelDelivery {
            channel: channel.name().to_string(),
            delivered: error.is_none(),
            attempts: attempts.load(Ordering::Relaxed),
            error,
        }
    }
}
