//! Email delivery.
//!
//! Delivery is a blocking call into an external service, so callers run
//! [`Mailer::send`] on the blocking pool. [`SmtpMailer`] is the production
//! transport; [`LogMailer`] stands in when no SMTP server is configured.

use std::fmt;
use std::sync::Mutex;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use tracing::{debug, info};

use crate::network::env_or;

/// Sender shown on outgoing mail.
pub const FROM_NAME: &str = "Final Aisle";

/// Subject of the verification email.
pub const VERIFY_SUBJECT: &str = "Verify Email Address";

/// Delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Recipient address was rejected.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The delivery service failed.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Transport settings are unusable.
    #[error("mail configuration error: {0}")]
    Config(String),
}

/// One outgoing HTML message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Recipient address.
    pub to: String,
    /// Recipient display name.
    pub to_name: String,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html_body: String,
}

/// Escape text for an HTML body.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Build the verification email carrying `code`.
pub fn verification_email(to: &str, username: &str, code: &str) -> Email {
    let name = escape_html(username);
    let code = escape_html(code);
    let html_body = format!(
        "<body><center>\
         <p style=\"font-family:Trebuchet MS;font-size:17px\">Hi <b>{name}</b>! \
         Your account setup is almost complete. All that's left is email verification, \
         we just want to make sure it's really you! \
         Here is your six-digit alphanumeric confirmation code.</p>\
         <h1 style=\"font-family:Arial Black;font-size:32px\">{code}</h1>\
         <p style=\"font-family:Trebuchet MS;font-size:17px\">Thank you for installing \
         <b>{FROM_NAME}</b>! See you on the isle :)</p>\
         </center></body>"
    );

    Email {
        to: to.to_owned(),
        to_name: username.to_owned(),
        subject: VERIFY_SUBJECT.to_owned(),
        html_body,
    }
}

/// External email-delivery collaborator.
pub trait Mailer: Send + Sync {
    /// Deliver `email`. Blocking.
    fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Writes mail to the log instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, email: &Email) -> Result<(), MailError> {
        if !email.to.contains('@') {
            return Err(MailError::InvalidRecipient(email.to.clone()));
        }
        info!(to = %email.to, subject = %email.subject, "Mail queued (log transport)");
        debug!(body = %email.html_body, "Mail body");
        Ok(())
    }
}

// =============================================================================
// SMTP
// =============================================================================

/// SMTP submission settings.
#[derive(Clone)]
pub struct SmtpConfig {
    /// Relay host.
    pub host: String,
    /// Submission port (STARTTLS).
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Sender address.
    pub from: String,
}

impl SmtpConfig {
    /// Default submission port.
    pub const DEFAULT_PORT: u16 = 587;

    /// Settings from the environment, or `None` when `FINAL_AISLE_SMTP_HOST`
    /// is unset.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("FINAL_AISLE_SMTP_HOST").ok()?;
        let username = std::env::var("FINAL_AISLE_SMTP_USER").unwrap_or_default();

        Some(Self {
            host,
            port: env_or("FINAL_AISLE_SMTP_PORT", Self::DEFAULT_PORT),
            password: std::env::var("FINAL_AISLE_SMTP_PASSWORD").unwrap_or_default(),
            from: std::env::var("FINAL_AISLE_SMTP_FROM").unwrap_or_else(|_| username.clone()),
            username,
        })
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from", &self.from)
            .finish()
    }
}

/// Delivers mail through an SMTP relay with STARTTLS.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport. Nothing is sent until the first message.
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from: Address = config
            .from
            .parse()
            .map_err(|e| MailError::Config(format!("sender {:?}: {}", config.from, e)))?;

        let mut builder = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| MailError::Config(e.to_string()))?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from: Mailbox::new(Some(FROM_NAME.to_owned()), from),
        })
    }

    fn message(&self, email: &Email) -> Result<Message, MailError> {
        let to: Address = email
            .to
            .parse()
            .map_err(|_| MailError::InvalidRecipient(email.to.clone()))?;

        Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(Some(email.to_name.clone()), to))
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())
            .map_err(|e| MailError::Delivery(e.to_string()))
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, email: &Email) -> Result<(), MailError> {
        let message = self.message(email)?;
        info!(to = %email.to, "Sending verification email");
        self.transport
            .send(&message)
            .map_err(|e| MailError::Delivery(e.to_string()))?;
        Ok(())
    }
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

/// Keeps every sent message in memory.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<Email>>,
}

impl MemoryMailer {
    /// Empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all messages sent so far.
    pub fn sent(&self) -> Vec<Email> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, email: &Email) -> Result<(), MailError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| MailError::Delivery("outbox poisoned".into()))?;
        sent.push(email.clone());
        Ok(())
    }
}
