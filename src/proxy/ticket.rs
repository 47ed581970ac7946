//
// src/proxy/ticket.rs
//
//! The obtain-ticket exchange used both to probe license servers and to
//! judge proxied ticket responses.

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use url::Url;

use crate::config::ProbeConfig;

pub const OBTAIN_TICKET_PATH: &str = "/rpc/obtainTicket.action";

const RESPONSE_ROOT: &str = "ObtainTicketResponse";

/// Whether a forwarded path targets the ticket-obtaining endpoint, whose
/// response has to be buffered and classified before it is relayed.
pub fn is_obtain_ticket_request(path: &str) -> bool {
    path.contains(OBTAIN_TICKET_PATH)
}

/// A short random lowercase word for the `userName`/`hostName` parameters.
pub fn probe_word() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(5..=10);
    std::iter::repeat_with(|| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .take(len)
        .collect()
}

/// Builds the synthetic obtain-ticket URL for `endpoint`.
pub fn probe_url(endpoint: &Url, probe: &ProbeConfig) -> Result<Url, url::ParseError> {
    let mut url = endpoint.join(OBTAIN_TICKET_PATH.trim_start_matches('/'))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("machineId", &probe.machine_id)
        .append_pair("productFamilyId", &probe.product_family_id)
        .append_pair("salt", &Utc::now().timestamp_millis().to_string())
        .append_pair("userName", &probe_word())
        .append_pair("hostName", &probe_word());
    Ok(url)
}

/// Outcome of reading one obtain-ticket response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketVerdict {
    pub available: bool,
    pub status: String,
}

impl TicketVerdict {
    fn unknown() -> Self {
        Self {
            available: false,
            status: "unknown".to_string(),
        }
    }
}

/// Classifies an obtain-ticket response. Never fails: unparsable input is
/// reported as unavailable with an `error: ...` status.
pub fn classify(body: &str) -> TicketVerdict {
    // An empty document is "no answer", not a parse error.
    if body.trim().is_empty() {
        return TicketVerdict::unknown();
    }

    let doc = match roxmltree::Document::parse(body) {
        Ok(doc) => doc,
        Err(e) => {
            return TicketVerdict {
                available: false,
                status: format!("error: {e}"),
            }
        }
    };

    let root = doc.root_element();
    if root.tag_name().name() != RESPONSE_ROOT {
        return TicketVerdict::unknown();
    }

    let available = first_child_text(root, "responseCode") == Some("OK");
    let status = match first_child_text(root, "message") {
        Some(message) if !message.is_empty() => format!("JB: {message}"),
        Some(_) => "OK".to_string(),
        None if available => "OK".to_string(),
        None => "unknown".to_string(),
    };

    TicketVerdict { available, status }
}

fn first_child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == name)
        .map(|child| child.text().unwrap_or(""))
}
