//! SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use crate::config::MailConfig;
use crate::error::CollaboratorError;
use crate::pipeline::collaborators::MailTransport;
use crate::pipeline::types::{DeliveryReceipt, OutboundMail};

const SERVICE: &str = "mail";

pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self, CollaboratorError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| CollaboratorError::NotConfigured {
                service: SERVICE.to_string(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        let from = config
            .from_address
            .parse()
            .map_err(|e| CollaboratorError::NotConfigured {
                service: SERVICE.to_string(),
                reason: format!("Invalid from address: {e}"),
            })?;

        Ok(Self { transport, from })
    }

    /// Build the MIME message; returns it with its Message-ID.
    fn build(&self, mail: &OutboundMail) -> Result<(Message, String), CollaboratorError> {
        let rejected = |reason: String| CollaboratorError::Rejected {
            service: SERVICE.to_string(),
            reason,
        };

        let domain = self.from.email.domain().to_string();
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(mail
                .to
                .parse()
                .map_err(|e| rejected(format!("Invalid to address: {e}")))?)
            .subject(mail.subject.as_str())
            .message_id(Some(message_id.clone()));
        if let Some(parent) = &mail.in_reply_to {
            builder = builder.in_reply_to(parent.clone()).references(parent.clone());
        }

        let message = builder
            .multipart(MultiPart::alternative_plain_html(
                mail.text_body.clone(),
                mail.html_body.clone(),
            ))
            .map_err(|e| rejected(format!("Failed to build email: {e}")))?;
        Ok((message, message_id))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &OutboundMail) -> Result<DeliveryReceipt, CollaboratorError> {
        let (message, message_id) = self.build(mail)?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| CollaboratorError::Network {
                service: SERVICE.to_string(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| {
                if e.is_permanent() {
                    CollaboratorError::Rejected {
                        service: SERVICE.to_string(),
                        reason: format!("SMTP send failed: {e}"),
                    }
                } else {
                    CollaboratorError::Network {
                        service: SERVICE.to_string(),
                        reason: format!("SMTP send failed: {e}"),
                    }
                }
            })?;

        info!(tenant_id = %mail.tenant_id, to = %mail.to, %message_id, "Email sent");
        Ok(DeliveryReceipt {
            delivery_id: message_id,
        })
    }
}
