use std::sync::Arc;

use axum::Extension;
use serde::Deserialize;

use crate::config::Config;
use crate::extract::Json;
use crate::mailer::{contact_message, is_valid_address, Mailer};
use crate::{breaks, notice, Error, Notice, Payload};

pub async fn contact(
    Extension(config): Extension<Arc<Config>>,
    Extension(mailer): Extension<Mailer>,
    Json(form): Json<ContactForm>,
) -> Payload<Notice> {
    let email = form.email.as_deref().map(str::trim).unwrap_or_default();
    let message = form.message.as_deref().map(str::trim).unwrap_or_default();
    if email.is_empty() || message.is_empty() {
        return breaks(Error::invalid("Email and message are required"));
    }
    if !is_valid_address(email) {
        return breaks(Error::invalid("Invalid email address"));
    }

    let mail = contact_message(&config.mail.contact_inbox, email, message);
    if let Err(err) = mailer.send(&mail).await {
        log::error!("Contact message from {} not delivered: {:#}", email, err);
        return breaks(Error::InternalError {
            kind: "MailError",
            message: "Failed to send message. Check server logs.".to_string(),
        });
    }
    notice("Message sent successfully!")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactForm {
    email: Option<String>,
    message: Option<String>,
}
