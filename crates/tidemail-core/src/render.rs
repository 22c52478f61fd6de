//! Message rendering to RFC 5322 bytes

use mail_builder::headers::address::Address;
use mail_builder::headers::text::Text;
use mail_builder::MessageBuilder;
use tidemail_common::types::{Email, Participant};
use tidemail_common::{Error, Result};

fn address(p: &Participant) -> Address<'_> {
    let name = if p.name.is_empty() { None } else { Some(p.name.as_str()) };
    Address::new_address(name, p.address.as_str())
}

fn address_list(list: &[Participant]) -> Address<'_> {
    Address::new_list(list.iter().map(address).collect())
}

/// Render a message with the given Message-ID domain
pub fn render(email: &Email, domain: &str) -> Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .from(address(&email.from))
        .subject(email.subject.as_str());

    if !email.to.is_empty() {
        builder = builder.to(address_list(&email.to));
    }
    if !email.cc.is_empty() {
        builder = builder.cc(address_list(&email.cc));
    }
    // Bcc recipients are envelope-only
    if !email.reply_to.is_empty() {
        builder = builder.reply_to(address_list(&email.reply_to));
    }
    if let Some(sender) = &email.sender {
        builder = builder.sender(address(sender));
    }
    if !email.read_receipt.is_empty() {
        builder = builder.header(
            "Disposition-Notification-To",
            Text::new(email.read_receipt.join(", ")),
        );
    }
    if email.id > 0 && !domain.is_empty() {
        builder = builder.message_id(format!("{}.tidemail@{}", email.id, domain));
    }
    if let Some(created_at) = email.created_at {
        builder = builder.date(created_at.timestamp());
    }

    if !email.text.is_empty() || email.html.is_empty() {
        builder = builder.text_body(email.text.as_str());
    }
    if !email.html.is_empty() {
        builder = builder.html_body(email.html.as_str());
    }
    for attachment in &email.attachments {
        builder = builder.attachment(
            attachment.content_type.as_str(),
            attachment.filename.as_str(),
            attachment.content.as_slice(),
        );
    }

    builder
        .write_to_vec()
        .map_err(|e| Error::Internal(format!("Failed to render message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemail_common::types::Attachment;

    fn sample() -> Email {
        Email {
            id: 42,
            subject: "Quarterly report".to_string(),
            from: Participant::new("Alice", "alice@example.com"),
            to: vec![Participant::new("", "bob@remote.test")],
            bcc: vec![Participant::new("Hidden", "hidden@remote.test")],
            text: "See attached.".to_string(),
            html: "<p>See attached.</p>".to_string(),
            attachments: vec![Attachment {
                filename: "report.txt".to_string(),
                content_type: "text/plain".to_string(),
                content: b"numbers".to_vec(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_render_headers() {
        let raw = String::from_utf8(render(&sample(), "example.com").unwrap()).unwrap();
        assert!(raw.contains("Subject: Quarterly report"));
        assert!(raw.contains("alice@example.com"));
        assert!(raw.contains("bob@remote.test"));
        assert!(raw.contains("<42.tidemail@example.com>"));
        assert!(raw.contains("report.txt"));
        assert!(!raw.contains("hidden@remote.test"));
    }

    #[test]
    fn test_rendered_message_parses_back() {
        let raw = render(&sample(), "example.com").unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&raw).unwrap();
        assert_eq!(parsed.subject(), Some("Quarterly report"));
        assert_eq!(parsed.attachment_count(), 1);
        assert_eq!(parsed.body_text(0).as_deref().map(str::trim), Some("See attached."));
    }
}
