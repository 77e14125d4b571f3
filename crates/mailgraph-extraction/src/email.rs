use chrono::{DateTime, Utc};

use mailgraph_core::entity::NewDocument;
use mailgraph_core::error::{MailgraphError, Result};

/// One parsed address header entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: Option<String>,
}

impl Mailbox {
    /// Name to store on the person node: the display name if present,
    /// otherwise the address.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.address.as_deref())
    }
}

/// Parses `"Name" <addr>`, `Name <addr>`, `<addr>` and bare `addr` forms. A
/// token without `@` is kept as a name-only mailbox. Blank input yields `None`.
pub fn parse_mailbox(raw: &str) -> Option<Mailbox> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
        if open < close {
            let address = raw[open + 1..close].trim();
            let name = clean_name(&raw[..open]);
            let address = (!address.is_empty()).then(|| address.to_string());
            if address.is_none() && name.is_none() {
                return None;
            }
            return Some(Mailbox { name, address });
        }
    }

    if raw.contains('@') {
        Some(Mailbox {
            name: None,
            address: Some(raw.trim_matches(|c| c == '"' || c == '\'').to_string()),
        })
    } else {
        clean_name(raw).map(|name| Mailbox {
            name: Some(name),
            address: None,
        })
    }
}

fn clean_name(raw: &str) -> Option<String> {
    let name = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Splits an address header on commas that sit outside quotes and angle brackets.
pub fn split_address_list(raw: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_angle => {
                let entry = current.trim();
                if !entry.is_empty() {
                    entries.push(entry.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let entry = current.trim();
    if !entry.is_empty() {
        entries.push(entry.to_string());
    }
    entries
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    // Drop trailing zone comments such as "(PDT)".
    let trimmed = raw.split('(').next().unwrap_or(raw).trim();
    DateTime::parse_from_rfc2822(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MailgraphError::Validation(format!("unparseable Date header {raw:?}: {e}")))
}

/// Parses an RFC 822-style message: header block with folded continuation
/// lines, a blank line, then the body.
pub fn parse_raw_email(raw: &str) -> Result<NewDocument> {
    let normalized = raw.replace("\r\n", "\n");
    let (header_block, body) = match normalized.find("\n\n") {
        Some(i) => (&normalized[..i], normalized[i + 2..].to_string()),
        None => (normalized.as_str(), String::new()),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in header_block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    let header = |name: &str| -> Option<&str> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    };
    let list = |name: &str| header(name).map(split_address_list).unwrap_or_default();

    let message_id = header("message-id")
        .ok_or_else(|| MailgraphError::Validation("missing Message-ID header".into()))?
        .to_string();
    let timestamp = match header("date") {
        Some(date) => parse_date(date)?,
        None => return Err(MailgraphError::Validation(format!("{message_id}: missing Date header"))),
    };

    Ok(NewDocument {
        message_id,
        from: header("from").unwrap_or_default().to_string(),
        to: list("to"),
        cc: list("cc"),
        bcc: list("bcc"),
        subject: header("subject").unwrap_or_default().to_string(),
        body: body.trim_end().to_string(),
        timestamp,
    })
}
